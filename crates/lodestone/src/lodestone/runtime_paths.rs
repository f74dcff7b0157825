use std::path::{Component, Path, PathBuf};

use anyhow::Context;

/// Filesystem locations derived from the config path and CLI overrides.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub config_path: PathBuf,
    pub servers_dir: PathBuf,
}

/// `servers_dir` precedence: CLI flag / env, then the config file's own
/// setting (already resolved against the config dir).
pub fn resolve_runtime_paths(
    config_path: &Path,
    servers_dir_flag: Option<PathBuf>,
    servers_dir_config: &Path,
) -> anyhow::Result<RuntimePaths> {
    let servers_dir = match servers_dir_flag {
        Some(p) => {
            if p.as_os_str().is_empty() {
                anyhow::bail!("servers dir: empty path");
            }
            if p.is_relative() {
                std::env::current_dir()
                    .context("servers dir: resolve cwd")?
                    .join(p)
            } else {
                p
            }
        }
        None => servers_dir_config.to_path_buf(),
    };
    let servers_dir = normalize_path(servers_dir);
    if servers_dir.as_os_str().is_empty() {
        anyhow::bail!("servers dir: empty path");
    }
    Ok(RuntimePaths {
        config_path: config_path.to_path_buf(),
        servers_dir,
    })
}

/// Joins a relative `p` onto `base`; absolute paths pass through.
pub fn resolve_relative(base: &Path, p: PathBuf) -> PathBuf {
    if p.is_relative() {
        normalize_path(base.join(p))
    } else {
        normalize_path(p)
    }
}

fn normalize_path(p: PathBuf) -> PathBuf {
    // Drops `.` segments only; `..` is left alone.
    let mut out = PathBuf::new();
    for c in p.components() {
        if matches!(c, Component::CurDir) {
            continue;
        }
        out.push(c.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servers_dir_falls_back_to_config_value() {
        let rp = resolve_runtime_paths(
            Path::new("/etc/lodestone/lodestone.toml"),
            None,
            Path::new("/etc/lodestone/servers"),
        )
        .expect("resolve");
        assert_eq!(rp.servers_dir, PathBuf::from("/etc/lodestone/servers"));
    }

    #[test]
    fn flag_wins_and_relative_is_cwd_based() {
        let rp = resolve_runtime_paths(
            Path::new("/etc/lodestone/lodestone.toml"),
            Some(PathBuf::from("./srv")),
            Path::new("/etc/lodestone/servers"),
        )
        .expect("resolve");
        assert_eq!(rp.servers_dir, std::env::current_dir().unwrap().join("srv"));
    }

    #[test]
    fn relative_join_drops_cur_dir() {
        assert_eq!(
            resolve_relative(Path::new("/cfg"), PathBuf::from("./servers")),
            PathBuf::from("/cfg/servers")
        );
        assert_eq!(
            resolve_relative(Path::new("/cfg"), PathBuf::from("/abs/servers")),
            PathBuf::from("/abs/servers")
        );
    }
}
