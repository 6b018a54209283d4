//! Container platform and native path rendering.
//!
//! Requests always carry posix-style paths. Rendering into the form the
//! container's platform expects happens here and nowhere else.

use serde::{Deserialize, Serialize};

/// Drive prefixed to rooted paths on Windows containers.
const WINDOWS_SYSTEM_DRIVE: &str = "C:";

/// Operating system family of a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Linux,
    Windows,
}

impl Platform {
    /// Render a request path in the platform's native form.
    ///
    /// `/tmp` stays `/tmp` on Linux and becomes `C:/tmp` on Windows. Paths
    /// already carrying a drive letter are left alone.
    pub fn render_path(&self, path: &str) -> String {
        match self {
            Platform::Linux => path.to_string(),
            Platform::Windows => {
                if has_drive_letter(path) {
                    path.to_string()
                } else if path.starts_with('/') || path.starts_with('\\') {
                    format!("{}{}", WINDOWS_SYSTEM_DRIVE, path)
                } else {
                    path.to_string()
                }
            }
        }
    }

    /// Whether `path` is absolute for this platform.
    pub fn is_absolute(&self, path: &str) -> bool {
        match self {
            Platform::Linux => path.starts_with('/'),
            Platform::Windows => {
                path.starts_with('/') || path.starts_with('\\') || has_drive_letter(path)
            }
        }
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_paths_unchanged() {
        assert_eq!(Platform::Linux.render_path("/tmp"), "/tmp");
    }

    #[test]
    fn test_windows_rooted_path_gets_drive() {
        assert_eq!(Platform::Windows.render_path("/tmp"), "C:/tmp");
        assert_eq!(Platform::Windows.render_path("D:/work"), "D:/work");
    }

    #[test]
    fn test_absolute_rules() {
        assert!(Platform::Linux.is_absolute("/root"));
        assert!(!Platform::Linux.is_absolute("root"));
        assert!(!Platform::Linux.is_absolute("C:/root"));
        assert!(Platform::Windows.is_absolute("C:/root"));
        assert!(Platform::Windows.is_absolute("/root"));
        assert!(!Platform::Windows.is_absolute("root"));
    }
}
