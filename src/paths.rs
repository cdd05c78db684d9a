use std::path::PathBuf;

/// Returns the user's home directory using common environment variables.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("PROMPTBATCH_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .map(PathBuf::from)
        })
}

/// Returns the default path to ~/.env (or $PROMPTBATCH_HOME/.env if set).
pub fn home_env_path() -> Option<PathBuf> {
    home_dir().map(|mut dir| {
        dir.push(".env");
        dir
    })
}

/// Directory where response files land when --output is not given.
pub fn responses_dir() -> PathBuf {
    PathBuf::from("data").join("responses")
}

/// Directory holding the per-run JSON debug logs.
pub fn log_dir() -> PathBuf {
    PathBuf::from("data").join("logs")
}
