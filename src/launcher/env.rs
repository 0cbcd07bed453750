use std::collections::BTreeMap;

use crate::config::LauncherConfig;
use crate::tokens::FrameContext;

/// `PATH` every frame starts from, regardless of the launcher's own.
pub const FRAME_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// What the environment of one frame is built from.
pub struct FrameEnvSource<'a> {
    pub config: &'a LauncherConfig,
    pub user_name: &'a str,
    pub show: &'a str,
    pub shot: &'a str,
    pub frame: &'a FrameContext,
    pub log_file: &'a str,
    /// Outline, layer and session variables
    pub outline_env: &'a BTreeMap<String, String>,
    /// Overrides carried by the RunFrame
    pub overrides: &'a BTreeMap<String, String>,
}

/// Parent environment without the configured secrets.
pub fn sanitized_parent_env(config: &LauncherConfig) -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(name, _)| !config.is_secret(name))
        .collect()
}

/// Build the full environment of a frame.
///
/// Later layers win: sanitized parent, worker identity, outline env, RunFrame
/// overrides. Frame tokens in values are substituted last.
pub fn build_frame_env(source: &FrameEnvSource<'_>) -> BTreeMap<String, String> {
    let mut env = sanitized_parent_env(source.config);

    let identity = [
        ("PATH", FRAME_PATH.to_string()),
        ("TERM", "unknown".to_string()),
        ("USER", source.user_name.to_string()),
        ("LOGNAME", source.user_name.to_string()),
        ("show", source.show.to_string()),
        ("shot", source.shot.to_string()),
        ("jobid", source.frame.job.clone()),
        ("jobhost", source.config.hostname.clone()),
        ("frame", source.frame.frame_name()),
        ("zframe", source.frame.zframe()),
        ("logfile", source.log_file.to_string()),
    ];
    for (key, value) in identity {
        env.insert(key.to_string(), value);
    }

    env.extend(source.outline_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(source.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    for value in env.values_mut() {
        if value.contains('#') {
            *value = source.frame.substitute(value);
        }
    }
    env
}
