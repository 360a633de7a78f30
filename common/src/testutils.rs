#[cfg(test)]
pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("pcp_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

#[cfg(test)]
pub async fn write_file_of_size(path: &std::path::Path, size: usize) -> anyhow::Result<()> {
    let contents: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(path, contents).await?;
    Ok(())
}

#[cfg(test)]
pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    //    |- qux
    //       |- 7.txt
    // |- empty
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await.unwrap();
    tokio::fs::write(foo_path.join("0.txt"), "0").await.unwrap();
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await.unwrap();
    tokio::fs::write(bar_path.join("1.txt"), "1").await.unwrap();
    tokio::fs::write(bar_path.join("2.txt"), "2").await.unwrap();
    tokio::fs::write(bar_path.join("3.txt"), "3").await.unwrap();
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await.unwrap();
    tokio::fs::write(baz_path.join("4.txt"), "4").await.unwrap();
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt"))
        .await
        .unwrap();
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt"))
        .await
        .unwrap();
    let qux_path = baz_path.join("qux");
    tokio::fs::create_dir(&qux_path).await.unwrap();
    tokio::fs::write(qux_path.join("7.txt"), "7").await.unwrap();
    tokio::fs::create_dir(foo_path.join("empty")).await.unwrap();
    Ok(tmp_dir)
}

/// Checks that `dst` holds exactly the regular files and directories of `src` and no symlinks.
#[cfg(test)]
#[async_recursion::async_recursion]
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    use anyhow::Context;
    let mut expected = vec![];
    let mut src_entries = tokio::fs::read_dir(src).await?;
    while let Some(src_entry) = src_entries.next_entry().await? {
        let src_entry_path = src_entry.path();
        let src_entry_name = src_entry.file_name();
        let dst_entry_path = dst.join(&src_entry_name);
        let src_md = tokio::fs::symlink_metadata(&src_entry_path).await?;
        if src_md.is_symlink() {
            assert!(
                tokio::fs::symlink_metadata(&dst_entry_path).await.is_err(),
                "symlink {:?} must not be copied",
                &dst_entry_path
            );
            continue;
        }
        expected.push(src_entry_name);
        let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
            .await
            .context(format!(
                "Destination file {:?} is missing!",
                &dst_entry_path
            ))?;
        assert_eq!(src_md.is_file(), dst_md.is_file());
        assert_eq!(src_md.is_dir(), dst_md.is_dir());
        if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents);
        } else {
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    let mut actual = vec![];
    let mut dst_entries = tokio::fs::read_dir(dst).await?;
    while let Some(dst_entry) = dst_entries.next_entry().await? {
        actual.push(dst_entry.file_name());
    }
    expected.sort();
    actual.sort();
    assert_eq!(expected, actual, "unexpected entries in {:?}", dst);
    Ok(())
}
