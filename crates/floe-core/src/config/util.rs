use std::path::PathBuf;

/// Expand a leading `~` or `~/` to the user's home directory. `$HOME` wins
/// over the password database so tests and sudo sessions behave.
pub fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return path.to_string(),
    };
    match home_dir() {
        Some(home) if rest.is_empty() => home.to_string_lossy().into_owned(),
        Some(home) => home.join(rest).to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/srv/data"), "/srv/data");
        assert_eq!(expand_tilde("rel/~x"), "rel/~x");
        assert_eq!(expand_tilde("~other/x"), "~other/x");
    }

    #[test]
    fn test_expand_tilde_home_prefix() {
        let home = home_dir().unwrap();
        assert_eq!(
            expand_tilde("~/floe"),
            home.join("floe").to_string_lossy().to_string()
        );
        assert_eq!(expand_tilde("~"), home.to_string_lossy().to_string());
    }
}
