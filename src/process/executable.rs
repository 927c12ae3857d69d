use std::path::{Path, PathBuf};

use super::CommandError;

/// Resolves a declared command to an executable path. Commands that are
/// absolute or carry a path separator are taken as-is (and must exist);
/// bare names are searched on PATH.
pub fn resolve_executable(command: &str) -> Result<PathBuf, CommandError> {
    let candidate = Path::new(command);
    if candidate.is_absolute() || command.contains(std::path::MAIN_SEPARATOR) {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(CommandError::ExecutableNotFound(command.to_string()));
    }

    let paths = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&paths) {
        let resolved = dir.join(command);
        if resolved.is_file() {
            return Ok(resolved);
        }
    }

    Err(CommandError::ExecutableNotFound(command.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[cfg(unix)]
    #[test]
    fn resolves_bare_name_on_path() {
        let resolved = resolve_executable("sh").unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn missing_command_is_not_found() {
        assert_matches!(
            resolve_executable("definitely-not-a-real-binary"),
            Err(CommandError::ExecutableNotFound(_))
        );
    }

    #[cfg(unix)]
    #[test]
    fn absolute_path_is_taken_as_is() {
        let resolved = resolve_executable("/bin/sh").unwrap();
        assert_eq!(resolved, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn absolute_path_must_exist() {
        assert_matches!(
            resolve_executable("/nonexistent/dir/tool"),
            Err(CommandError::ExecutableNotFound(_))
        );
    }
}
