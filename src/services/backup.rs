//! Backup archives
//!
//! One gzip tarball of the deployed tree per deployment attempt. Archives are
//! never rewritten and never pruned here.

use chrono::{DateTime, Utc};

use crate::config::app::AppConfig;
use crate::infra::command::shell_quote;

/// Left out of every archive
///
/// `./`-prefixed entries only match at the top of the tree.
pub const ARCHIVE_EXCLUDES: &[&str] = &[
    "./venv",
    "./.venv",
    "./media",
    "./.cache",
    "__pycache__",
    "*.pyc",
];

/// Top-level entries a restore leaves in place
const RESTORE_KEEP: &[&str] = &["venv", ".venv", "media"];

/// `{backup_dir}/{app}-{YYYYmmdd-HHMMSS}-{release8}.tar.gz`
pub fn archive_path(app: &AppConfig, at: DateTime<Utc>, release_id: &str) -> String {
    let suffix = release_id.rsplit('-').next().unwrap_or(release_id);
    let short = &suffix[..suffix.len().min(8)];
    format!(
        "{}/{}-{}-{}.tar.gz",
        app.backup_dir.trim_end_matches('/'),
        app.name,
        at.format("%Y%m%d-%H%M%S"),
        short
    )
}

/// Env file path relative to the deploy directory, if it lives inside it
fn env_file_in_tree(app: &AppConfig) -> Option<String> {
    let prefix = format!("{}/", app.deploy_path.trim_end_matches('/'));
    app.env_file
        .strip_prefix(&prefix)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(str::to_string)
}

/// Archive the current tree (empty on a fresh host)
pub fn create_script(app: &AppConfig, archive: &str) -> String {
    let excludes = ARCHIVE_EXCLUDES
        .iter()
        .map(|p| format!("--exclude={}", shell_quote(p)))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "mkdir -p {deploy} {backup}\n\
         test ! -e {archive}\n\
         umask 077\n\
         tar -czf {archive} {excludes} -C {deploy} .\n\
         ls -l {archive}",
        deploy = shell_quote(&app.deploy_path),
        backup = shell_quote(&app.backup_dir),
        archive = shell_quote(archive),
        excludes = excludes,
    )
}

/// Replace the tree with the archive contents
///
/// The virtualenv, uploaded media and the live env file survive; everything
/// else in the deploy directory is removed first so files added by the failed
/// release do not linger.
pub fn restore_script(app: &AppConfig, archive: &str) -> String {
    let env_file = env_file_in_tree(app);

    let mut keep: Vec<String> = RESTORE_KEEP.iter().map(|s| s.to_string()).collect();
    keep.extend(env_file.clone());
    let keep_args = keep
        .iter()
        .map(|name| format!("! -name {}", shell_quote(name)))
        .collect::<Vec<_>>()
        .join(" ");

    let extract_exclude = env_file
        .map(|name| format!(" --exclude={}", shell_quote(&format!("./{}", name))))
        .unwrap_or_default();

    format!(
        "test -f {archive}\n\
         cd {deploy}\n\
         find . -mindepth 1 -maxdepth 1 {keep_args} -exec rm -rf {{}} +\n\
         tar -xzf {archive}{extract_exclude} -C {deploy}",
        archive = shell_quote(archive),
        deploy = shell_quote(&app.deploy_path),
        keep_args = keep_args,
        extract_exclude = extract_exclude,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::CommandRunner;
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn app_in(root: &Path) -> AppConfig {
        let deploy = root.join("www");
        AppConfig {
            deploy_path: deploy.display().to_string(),
            backup_dir: root.join("backups").display().to_string(),
            env_file: deploy.join(".env").display().to_string(),
            ..AppConfig::default()
        }
    }

    async fn sh(script: &str) -> crate::infra::command::CommandOutput {
        CommandRunner::run_with_streaming(
            "sh",
            &["-euc".to_string(), script.to_string()],
            None,
            None,
            None,
            Duration::from_secs(30),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_archive_path() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let path = archive_path(&AppConfig::default(), at, "20260314-092650-1a2b3c4d");
        assert_eq!(
            path,
            "/var/backups/medical-platform/medical-platform-20260314-092653-1a2b3c4d.tar.gz"
        );
    }

    #[test]
    fn test_restore_keeps_env_file_inside_tree() {
        let script = restore_script(&AppConfig::default(), "/b/a.tar.gz");
        assert!(script.contains("! -name venv ! -name .venv ! -name media ! -name .env"));
        assert!(script.contains("tar -xzf /b/a.tar.gz --exclude=./.env -C /var/www/medical-platform"));
    }

    #[test]
    fn test_restore_with_env_file_outside_tree() {
        let mut app = AppConfig::default();
        app.env_file = "/etc/medical-platform/env".to_string();
        let script = restore_script(&app, "/b/a.tar.gz");
        assert!(!script.contains("--exclude"));
        assert!(!script.contains("-name env"));
    }

    #[tokio::test]
    async fn test_backup_of_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_in(dir.path());
        let archive = format!("{}/first.tar.gz", app.backup_dir);

        let output = sh(&create_script(&app, &archive)).await;
        assert!(output.success(), "{}", output.stderr);
        assert!(Path::new(&archive).is_file());
        assert!(Path::new(&app.deploy_path).is_dir());
    }

    #[tokio::test]
    async fn test_existing_archive_is_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_in(dir.path());
        let archive = format!("{}/same.tar.gz", app.backup_dir);

        assert!(sh(&create_script(&app, &archive)).await.success());
        assert!(!sh(&create_script(&app, &archive)).await.success());
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_in(dir.path());
        let deploy = Path::new(&app.deploy_path);

        fs::create_dir_all(deploy.join("venv/bin")).unwrap();
        fs::create_dir_all(deploy.join("media")).unwrap();
        fs::create_dir_all(deploy.join("core/__pycache__")).unwrap();
        fs::write(deploy.join("manage.py"), "v1").unwrap();
        fs::write(deploy.join("venv/bin/python"), "py").unwrap();
        fs::write(deploy.join("media/scan.png"), "img").unwrap();
        fs::write(deploy.join("core/__pycache__/x.pyc"), "bytecode").unwrap();
        fs::write(deploy.join(".env"), "SECRET_KEY=old").unwrap();

        let archive = format!("{}/r.tar.gz", app.backup_dir);
        let output = sh(&create_script(&app, &archive)).await;
        assert!(output.success(), "{}", output.stderr);

        let listing = sh(&format!("tar -tzf {}", archive)).await.stdout;
        assert!(listing.contains("./manage.py"));
        assert!(!listing.contains("venv"));
        assert!(!listing.contains("media"));
        assert!(!listing.contains("__pycache__"));

        // The new release changes code, adds a file and rotates the env file
        fs::write(deploy.join("manage.py"), "v2").unwrap();
        fs::write(deploy.join("new_module.py"), "new").unwrap();
        fs::write(deploy.join(".env"), "SECRET_KEY=new").unwrap();
        fs::write(deploy.join("media/upload.png"), "img2").unwrap();

        let output = sh(&restore_script(&app, &archive)).await;
        assert!(output.success(), "{}", output.stderr);

        assert_eq!(fs::read_to_string(deploy.join("manage.py")).unwrap(), "v1");
        assert!(!deploy.join("new_module.py").exists());
        assert_eq!(fs::read_to_string(deploy.join(".env")).unwrap(), "SECRET_KEY=new");
        assert!(deploy.join("venv/bin/python").exists());
        assert!(deploy.join("media/upload.png").exists());
    }
}
