//! Remote step scripts
//!
//! Every function returns a POSIX shell script for one stage. Scripts run
//! under `set -eu`, so the first failing command fails the stage.

use crate::config::app::AppConfig;
use crate::infra::command::shell_quote;

/// Packages a fresh host needs
pub const SYSTEM_PACKAGES: &[&str] = &[
    "python3",
    "python3-venv",
    "python3-pip",
    "nginx",
    "curl",
    "git",
    "rsync",
];

/// Never pushed by rsync and never deleted by `--delete`
pub const TREE_EXCLUDES: &[&str] = &[
    ".git",
    "venv",
    ".venv",
    ".env",
    "media",
    "staticfiles",
    "__pycache__",
    "*.pyc",
];

/// Tree paths a code update must leave alone: [`TREE_EXCLUDES`] plus the env
/// file when it lives in the deploy directory
pub fn preserved_paths(app: &AppConfig) -> Vec<String> {
    let mut paths: Vec<String> = TREE_EXCLUDES.iter().map(|s| s.to_string()).collect();
    let prefix = format!("{}/", app.deploy_path.trim_end_matches('/'));
    if let Some(name) = app.env_file.strip_prefix(&prefix) {
        if !paths.iter().any(|p| p == name) {
            paths.push(name.to_string());
        }
    }
    paths
}

/// Run `script` as root (via `sudo -n` for non-root logins)
pub fn as_root(needs_sudo: bool, script: &str) -> String {
    if needs_sudo {
        format!("sudo -n sh -euc {}", shell_quote(script))
    } else {
        script.to_string()
    }
}

/// Install system packages, create the application user and directories
pub fn install_packages(app: &AppConfig) -> String {
    let user = shell_quote(&app.app_user);
    let deploy = shell_quote(&app.deploy_path);
    format!(
        "export DEBIAN_FRONTEND=noninteractive\n\
         apt-get update -q\n\
         apt-get install -y -q {packages}\n\
         id -u {user} >/dev/null 2>&1 || useradd --system --home-dir {deploy} --shell /usr/sbin/nologin {user}\n\
         mkdir -p {deploy} {backup} {media} {static}\n\
         chown {user}:{user} {deploy} {media} {static}\n\
         rm -f /etc/nginx/sites-enabled/default\n\
         systemctl enable --now nginx",
        packages = SYSTEM_PACKAGES.join(" "),
        user = user,
        deploy = deploy,
        backup = shell_quote(&app.backup_dir),
        media = shell_quote(&app.media_root()),
        static = shell_quote(&app.static_root()),
    )
}

/// Bring the tree to the tip of `branch`
///
/// An existing checkout is fetched and hard-reset. A directory without a
/// checkout is initialised in place from `repo_url`, which also works when
/// the directory already holds media or a virtualenv.
pub fn update_git(app: &AppConfig, repo_url: Option<&str>, branch: &str) -> String {
    let deploy = shell_quote(&app.deploy_path);
    let branch = shell_quote(branch);
    let keep = preserved_paths(app)
        .iter()
        .filter(|p| p.as_str() != ".git")
        .map(|p| format!(" -e {}", shell_quote(p)))
        .collect::<String>();

    let init = match repo_url {
        Some(url) => format!(
            "  git_ init -q\n  git_ remote add origin {}",
            shell_quote(url)
        ),
        None => "  echo \"no git checkout in $PWD and no repository URL configured\" >&2\n  exit 1"
            .to_string(),
    };

    format!(
        "git_() {{ git -c safe.directory={deploy} \"$@\"; }}\n\
         mkdir -p {deploy}\n\
         cd {deploy}\n\
         if [ ! -d .git ]; then\n\
         {init}\n\
         fi\n\
         git_ fetch --prune origin {branch}\n\
         git_ reset --hard FETCH_HEAD\n\
         git_ clean -fd -q{keep}\n\
         chown -R {owner} {deploy}\n\
         git_ rev-parse --short HEAD",
        deploy = deploy,
        init = init,
        branch = branch,
        keep = keep,
        owner = owner(app),
    )
}

/// Ownership fix-up after an rsync push
pub fn fix_ownership(app: &AppConfig) -> String {
    format!(
        "chown -R {} {}",
        owner(app),
        shell_quote(&app.deploy_path)
    )
}

/// Create the virtualenv if missing and install requirements
pub fn install_dependencies(app: &AppConfig) -> String {
    format!(
        "cd {deploy}\n\
         test -f requirements.txt\n\
         [ -x venv/bin/python ] || {python} -m venv venv\n\
         venv/bin/pip install -q --upgrade pip\n\
         venv/bin/pip install -q -r requirements.txt gunicorn\n\
         chown -R {owner} venv",
        deploy = shell_quote(&app.deploy_path),
        python = shell_quote(&app.python),
        owner = owner(app),
    )
}

/// Prints `present` or `absent`
pub fn env_file_status(app: &AppConfig) -> String {
    format!(
        "if [ -f {0} ]; then echo present; else echo absent; fi",
        shell_quote(&app.env_file)
    )
}

pub fn read_file(path: &str) -> String {
    format!("cat {}", shell_quote(path))
}

/// Env template path on the host
pub fn env_template_path(app: &AppConfig) -> String {
    if app.env_template.starts_with('/') {
        app.env_template.clone()
    } else {
        format!("{}/{}", app.deploy_path, app.env_template)
    }
}

/// Move an uploaded env file into place, readable by the application user only
pub fn install_env_file(app: &AppConfig, uploaded: &str) -> String {
    let user = shell_quote(&app.app_user);
    format!(
        "install -m 600 -o {user} -g {user} {src} {dest}\n\
         rm -f {src}",
        user = user,
        src = shell_quote(uploaded),
        dest = shell_quote(&app.env_file),
    )
}

/// Run a `manage.py` command as the application user with the env file loaded
pub fn manage_py(app: &AppConfig, command: &str) -> String {
    let inner = format!(
        "set -a; . {env}; set +a; DJANGO_SETTINGS_MODULE={settings} exec venv/bin/python manage.py {command}",
        env = shell_quote(&app.env_file),
        settings = shell_quote(&app.settings_module),
        command = command,
    );
    format!(
        "cd {deploy}\n\
         runuser -u {user} -- sh -euc {inner}",
        deploy = shell_quote(&app.deploy_path),
        user = shell_quote(&app.app_user),
        inner = shell_quote(&inner),
    )
}

pub fn migrate(app: &AppConfig) -> String {
    manage_py(app, "migrate --noinput")
}

pub fn collect_static(app: &AppConfig) -> String {
    manage_py(app, "collectstatic --noinput")
}

/// Install changed unit/site files and (re)load both services
///
/// The unit is reloaded (SIGHUP) when unchanged, restarted when its definition
/// changed and started when not running. `nginx -t` gates the proxy reload.
pub fn install_and_reload(app: &AppConfig, uploaded_unit: &str, uploaded_site: &str) -> String {
    let unit = shell_quote(&app.unit_name());
    let unit_path = shell_quote(&app.unit_path());
    let site_available = shell_quote(&app.site_available_path());
    let site_enabled = shell_quote(&app.site_enabled_path());
    let tmp_unit = shell_quote(uploaded_unit);
    let tmp_site = shell_quote(uploaded_site);

    format!(
        "unit_changed=0\n\
         if ! cmp -s {tmp_unit} {unit_path}; then\n\
         \x20 install -m 644 {tmp_unit} {unit_path}\n\
         \x20 unit_changed=1\n\
         \x20 echo \"installed {unit_path}\"\n\
         fi\n\
         rm -f {tmp_unit}\n\
         systemctl daemon-reload\n\
         systemctl enable -q {unit}\n\
         if ! systemctl is-active --quiet {unit}; then\n\
         \x20 systemctl start {unit}\n\
         elif [ \"$unit_changed\" = 1 ]; then\n\
         \x20 systemctl restart {unit}\n\
         else\n\
         \x20 systemctl reload {unit}\n\
         fi\n\
         if ! cmp -s {tmp_site} {site_available}; then\n\
         \x20 install -m 644 {tmp_site} {site_available}\n\
         \x20 echo \"installed {site_available}\"\n\
         fi\n\
         rm -f {tmp_site}\n\
         ln -sfn {site_available} {site_enabled}\n\
         nginx -t\n\
         if systemctl is-active --quiet nginx; then\n\
         \x20 systemctl reload nginx\n\
         else\n\
         \x20 systemctl start nginx\n\
         fi",
        unit = unit,
        unit_path = unit_path,
        site_available = site_available,
        site_enabled = site_enabled,
        tmp_unit = tmp_unit,
        tmp_site = tmp_site,
    )
}

/// Restart the application and reload the proxy after a restore
pub fn restart_services(app: &AppConfig) -> String {
    format!(
        "systemctl restart {}\n\
         nginx -t\n\
         systemctl reload nginx",
        shell_quote(&app.unit_name())
    )
}

/// Temp path for an uploaded file of this release
pub fn upload_path(app: &AppConfig, release_id: &str, suffix: &str) -> String {
    format!("/tmp/{}-{}.{}", app.name, release_id, suffix)
}

fn owner(app: &AppConfig) -> String {
    let user = shell_quote(&app.app_user);
    format!("{0}:{0}", user)
}
