use crate::TransferError;

/// Validates a remote file path.
///
/// Rejects:
/// - Empty paths
/// - Relative paths (must start with `/`)
/// - Paths naming a directory (`/` or a trailing `/`)
/// - Parent directory traversal (`..`)
pub fn validate_remote_path(path: &str) -> Result<(), TransferError> {
    if path.is_empty() {
        return Err(TransferError::Config("empty remote path".into()));
    }
    if !path.starts_with('/') {
        return Err(TransferError::Config(format!(
            "remote path must be absolute: {path}"
        )));
    }
    if path.ends_with('/') {
        return Err(TransferError::Config(format!(
            "remote path names a directory: {path}"
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(TransferError::Config(format!(
            "parent directory traversal not allowed: {path}"
        )));
    }
    Ok(())
}

/// Places `target` inside the application folder `/apps/{app_name}`.
///
/// Relative targets are joined onto the folder; absolute targets must
/// already be inside it.
pub fn app_scoped_path(app_name: &str, target: &str) -> Result<String, TransferError> {
    if app_name.is_empty() || app_name.contains('/') {
        return Err(TransferError::Config(format!(
            "invalid application name: {app_name:?}"
        )));
    }
    let root = format!("/apps/{app_name}/");
    let scoped = if target.starts_with('/') {
        if !target.starts_with(&root) {
            return Err(TransferError::Config(format!(
                "uploads must stay inside {root}: {target}"
            )));
        }
        target.to_string()
    } else {
        let relative = target.trim_start_matches("./");
        format!("{root}{relative}")
    };
    validate_remote_path(&scoped)?;
    Ok(scoped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_remote_path("").is_err());
    }

    #[test]
    fn rejects_relative_path() {
        assert!(matches!(
            validate_remote_path("apps/demo/a.txt"),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn rejects_directory_paths() {
        assert!(validate_remote_path("/").is_err());
        assert!(validate_remote_path("/apps/demo/").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_remote_path("/apps/demo/../../etc").is_err());
        assert!(validate_remote_path("/..").is_err());
    }

    #[test]
    fn accepts_absolute_file_paths() {
        assert!(validate_remote_path("/a.txt").is_ok());
        assert!(validate_remote_path("/apps/demo/sub dir/movie..mkv").is_ok());
    }

    #[test]
    fn scopes_relative_targets() {
        assert_eq!(
            app_scoped_path("demo", "backup/db.tar").unwrap(),
            "/apps/demo/backup/db.tar"
        );
        assert_eq!(
            app_scoped_path("demo", "./db.tar").unwrap(),
            "/apps/demo/db.tar"
        );
    }

    #[test]
    fn keeps_absolute_targets_inside_app_folder() {
        assert_eq!(
            app_scoped_path("demo", "/apps/demo/x.bin").unwrap(),
            "/apps/demo/x.bin"
        );
        assert!(app_scoped_path("demo", "/apps/other/x.bin").is_err());
        assert!(app_scoped_path("demo", "/x.bin").is_err());
    }

    #[test]
    fn rejects_escaping_targets() {
        assert!(app_scoped_path("demo", "../other/x.bin").is_err());
        assert!(app_scoped_path("demo", "").is_err());
        assert!(app_scoped_path("", "x.bin").is_err());
        assert!(app_scoped_path("a/b", "x.bin").is_err());
    }
}
