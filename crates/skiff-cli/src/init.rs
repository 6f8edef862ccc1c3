//! Starter deploy structures.
//!
//! `skiff init <layout>` writes a small working deploy into the
//! current directory as a starting point. Existing files are never
//! overwritten.

use anyhow::{bail, Result};
use clap::ValueEnum;
use std::fs;
use std::path::Path;

/// The available starter structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Layout {
    /// A single inventory and deploy script.
    Minimal,
    /// Hosts, groups and several deploy scripts side by side.
    Flat,
    /// A dotfiles deploy for the local machine.
    Dotfiles,
    /// Reusable parameterized tasks called from a main deploy.
    Modular,
    /// Separate staging and production inventories sharing one deploy.
    StagingProd,
}

const INVENTORY_MINIMAL: &str = "\
# Define which hosts belong to this inventory.
hosts = [
    \"local:\",                   # local machine, as the invoking user
    # \"example\",                # remote machine via ssh config
    # \"ssh://root@example.com\", # explicit user and host
]
";

const HOST_LOCALHOST: &str = "\
# Define a (different) url for this host, e.g. if the inventory
# entry is just a name.
# url = \"ssh://root@localhost\"

# Variables for this host.
somevariable = \"this was defined by the host\"
";

const GROUP_ALL: &str = "\
somevariable = \"defined as a fallback in the 'all' group\"
";

const DEPLOY_MINIMAL: &str = "\
[[ops]]
kind = \"directory\"
path = \"/tmp/skiff-example\"
mode = \"755\"

[[ops]]
kind = \"upload_content\"
name = \"Drop a marker file\"
content = \"${somevariable}\\n\"
dest = \"/tmp/skiff-example/marker\"
mode = \"644\"
";

const DEPLOY_DOTFILES: &str = "\
[[ops]]
kind = \"upload_dir\"
name = \"Install dotfiles\"
src = \"files\"
dest = \"/home/you/.config/\"
";

const TASK_INSTALL: &str = "\
[[ops]]
kind = \"package\"
name = \"Install the application\"
packages = [\"nginx\"]

[[ops]]
kind = \"service\"
name = \"(Re-)start the service\"
service = \"nginx\"
state = \"restarted\"
enabled = true
";

const TASK_ADD_SITE: &str = "\
[params.site]
type = \"str\"

[[ops]]
kind = \"template\"
name = \"Create the site definition\"
src = \"templates/site.conf\"
dest = \"/etc/nginx/sites/${site}.conf\"

[[ops]]
kind = \"line\"
name = \"Enable the site\"
path = \"/etc/nginx/sites.list\"
line = \"sites/${site}.conf\"
";

const TEMPLATE_SITE: &str = "\
# ${skiff_managed}
server {
    server_name ${site};
    # ...
}
";

const DEPLOY_MODULAR: &str = "\
[[ops]]
kind = \"script\"
path = \"tasks/nginx/install.toml\"

[[ops]]
kind = \"script\"
name = \"Add site1.example.com\"
path = \"tasks/nginx/add_site.toml\"
params = { site = \"site1\" }

[[ops]]
kind = \"script\"
name = \"Add site2.example.com\"
path = \"tasks/nginx/add_site.toml\"
params = { site = \"site2\" }
";

const INVENTORY_STAGING: &str = "\
hosts = [
    { url = \"ssh://root@staging.example.com\", name = \"staging\", groups = [\"web\"] },
]
groups = [\"web\"]
";

const INVENTORY_PROD: &str = "\
hosts = [
    { url = \"ssh://root@web1.example.com\", name = \"web1\", groups = [\"web\"] },
    { url = \"ssh://root@web2.example.com\", name = \"web2\", groups = [\"web\"] },
]
groups = [\"web\"]
";

const GROUP_WEB: &str = "\
after = [\"all\"]
nginx_worker_processes = 4
";

/// Writes the given starter structure into the current directory.
pub fn scaffold(layout: Layout) -> Result<()> {
    let files: &[(&str, &str)] = match layout {
        Layout::Minimal => &[
            ("inventory.toml", INVENTORY_MINIMAL),
            ("hosts/localhost.toml", HOST_LOCALHOST),
            ("deploy.toml", DEPLOY_MINIMAL),
        ],
        Layout::Flat => &[
            ("inventory.toml", INVENTORY_MINIMAL),
            ("hosts/localhost.toml", HOST_LOCALHOST),
            ("groups/all.toml", GROUP_ALL),
            ("deploy.toml", DEPLOY_MINIMAL),
            ("nginx.toml", TASK_INSTALL),
        ],
        Layout::Dotfiles => &[
            ("inventory.toml", INVENTORY_MINIMAL),
            ("deploy.toml", DEPLOY_DOTFILES),
            ("files/.keep", ""),
        ],
        Layout::Modular => &[
            ("inventory.toml", INVENTORY_MINIMAL),
            ("hosts/localhost.toml", HOST_LOCALHOST),
            ("groups/all.toml", GROUP_ALL),
            ("deploy.toml", DEPLOY_MODULAR),
            ("tasks/nginx/install.toml", TASK_INSTALL),
            ("tasks/nginx/add_site.toml", TASK_ADD_SITE),
            ("templates/site.conf", TEMPLATE_SITE),
        ],
        Layout::StagingProd => &[
            ("inventories/staging.toml", INVENTORY_STAGING),
            ("inventories/prod.toml", INVENTORY_PROD),
            ("groups/web.toml", GROUP_WEB),
            ("hosts/staging.toml", HOST_LOCALHOST),
            ("deploy.toml", DEPLOY_MINIMAL),
        ],
    };

    // Never clobber an existing deploy.
    for (path, _) in files {
        if Path::new(path).exists() {
            bail!("refusing to overwrite existing file '{path}'");
        }
    }

    for (path, content) in files {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        println!("created {path}");
    }
    Ok(())
}
