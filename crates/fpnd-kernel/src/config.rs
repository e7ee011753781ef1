//! Settings loading and node role detection.
//!
//! Settings come from the first TOML file found among the candidate paths;
//! anything missing or unreadable falls back to defaults.

use fpnd_types::config::{NodeRole, NodeSettings};
use fpnd_types::state::NodeState;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// System-wide settings locations, searched in order.
const SYSTEM_CONFIG_PATHS: [&str; 2] = ["/etc/fpnd.toml", "/etc/fpnd/fpnd.toml"];

/// Candidate settings files: the explicit path first, then system, then user.
pub fn config_candidates(path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = path.map(Path::to_path_buf).into_iter().collect();
    candidates.extend(SYSTEM_CONFIG_PATHS.iter().map(PathBuf::from));
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("fpnd").join("fpnd.toml"));
    }
    candidates
}

/// Load settings from the first existing candidate file, with defaults.
pub fn load_config(path: Option<&Path>) -> NodeSettings {
    let Some(config_path) = config_candidates(path).into_iter().find(|p| p.exists()) else {
        info!("No settings file found, using defaults");
        return NodeSettings::default();
    };

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeSettings>(&contents) {
            Ok(settings) => {
                info!(path = %config_path.display(), "Loaded settings");
                return settings;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse settings, using defaults"
                );
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read settings file, using defaults"
            );
        }
    }
    NodeSettings::default()
}

/// Tentative role from the overlay daemon's role directories.
///
/// `moons.d/*.moon` marks a moon, `controller.d/*.controller` a controller.
pub fn detect_role(zt_home: &Path) -> Option<NodeRole> {
    for (role, dir, ext) in [
        (NodeRole::Moon, "moons.d", "moon"),
        (NodeRole::Controller, "controller.d", "controller"),
    ] {
        let Ok(entries) = std::fs::read_dir(zt_home.join(dir)) else {
            continue;
        };
        let found = entries
            .filter_map(|e| e.ok())
            .any(|e| e.path().extension().is_some_and(|x| x == ext));
        if found {
            debug!(%role, "Detected role files");
            return Some(role);
        }
    }
    None
}

/// Confirm the tentative role against the node's own id.
///
/// A node whose id is on the moon list is a moon. A controller stays a
/// controller. Everything else is a plain member.
pub fn validate_role(
    state: &NodeState,
    settings: &NodeSettings,
    tentative: Option<NodeRole>,
) -> Option<NodeRole> {
    let role = match state.fpn_id.as_deref() {
        Some(id) if settings.is_allowed_moon(id) => Some(NodeRole::Moon),
        _ if tentative == Some(NodeRole::Controller) => Some(NodeRole::Controller),
        _ => None,
    };
    debug!(role = ?role, "Validated role");
    role
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpnd_types::config::Mode;

    #[test]
    fn test_config_candidates_order() {
        let dir = tempfile::tempdir().unwrap();
        let candidates = config_candidates(Some(&dir.path().join("none.toml")));
        assert_eq!(candidates[0], dir.path().join("none.toml"));
        assert_eq!(candidates[1], PathBuf::from("/etc/fpnd.toml"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpnd.toml");
        std::fs::write(
            &path,
            r#"
            mode = "adhoc"
            nwid = "b6079f73c63cea29"
            max_cache_age_secs = 30
            use_localhost = false
            "#,
        )
        .unwrap();
        let settings = load_config(Some(&path));
        assert_eq!(settings.mode, Mode::Adhoc);
        assert_eq!(settings.nwid.as_deref(), Some("b6079f73c63cea29"));
        assert_eq!(settings.max_cache_age_secs, 30);
        assert!(!settings.use_localhost);
        assert_eq!(settings.offline_wait_secs, 75);
    }

    #[test]
    fn test_load_config_bad_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpnd.toml");
        std::fs::write(&path, "mode = [not toml").unwrap();
        assert_eq!(load_config(Some(&path)), NodeSettings::default());
    }

    #[test]
    fn test_detect_role() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_role(dir.path()), None);

        std::fs::create_dir(dir.path().join("controller.d")).unwrap();
        std::fs::write(dir.path().join("controller.d/net.controller"), "").unwrap();
        assert_eq!(detect_role(dir.path()), Some(NodeRole::Controller));

        std::fs::create_dir(dir.path().join("moons.d")).unwrap();
        std::fs::write(dir.path().join("moons.d/000000abc.moon"), "").unwrap();
        assert_eq!(detect_role(dir.path()), Some(NodeRole::Moon));
    }

    #[test]
    fn test_validate_role() {
        let settings = NodeSettings::default();
        let mut state = NodeState {
            fpn_id: Some("4f4114472a".into()),
            ..Default::default()
        };
        assert_eq!(validate_role(&state, &settings, None), Some(NodeRole::Moon));

        state.fpn_id = Some("abcdef0123".into());
        assert_eq!(validate_role(&state, &settings, Some(NodeRole::Moon)), None);
        assert_eq!(
            validate_role(&state, &settings, Some(NodeRole::Controller)),
            Some(NodeRole::Controller)
        );
    }
}
