use thiserror::Error;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("URL tried to traverse above root")]
pub struct InvalidPath;

/// Split a URL path into its safe components.
///
/// Empty components and `.` are dropped, `..` pops the previous component.
/// Popping past the root is an error. An empty result represents `/`.
pub fn normalize_path(path: &str) -> Result<Vec<String>, InvalidPath> {
    let mut normalized = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if normalized.pop().is_none() {
                    return Err(InvalidPath);
                }
            }
            comp => normalized.push(comp.to_string()),
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths() {
        assert_eq!(normalize_path("/a/b/c").unwrap(), ["a", "b", "c"]);
        assert_eq!(normalize_path("a/b").unwrap(), ["a", "b"]);
        assert_eq!(normalize_path("/").unwrap(), Vec::<String>::new());
        assert_eq!(normalize_path("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn dots_and_empties_are_dropped() {
        assert_eq!(normalize_path("/a//b/./c/").unwrap(), ["a", "b", "c"]);
        assert_eq!(normalize_path("./.").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn dotdot_pops() {
        assert_eq!(normalize_path("/a/b/../c").unwrap(), ["a", "c"]);
        assert_eq!(normalize_path("/a/..").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn traversal_above_root_is_rejected() {
        assert_eq!(normalize_path("/.."), Err(InvalidPath));
        assert_eq!(normalize_path("/../etc/passwd"), Err(InvalidPath));
        assert_eq!(normalize_path("/a/../../b"), Err(InvalidPath));
    }

    #[test]
    fn normalization_is_idempotent() {
        for path in ["/a/b/../c", "//x/./y//", "", "/deep/1/2/3"] {
            let once = normalize_path(path).unwrap();
            let again = normalize_path(&once.join("/")).unwrap();
            assert_eq!(once, again);
        }
    }
}
