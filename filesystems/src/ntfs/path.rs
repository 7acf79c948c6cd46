// Volume paths
// Paths are `\`-separated and absolute: `\` is the root directory, `\A\test.txt` a file in
// directory `A`. Names are validated before anything on the volume is touched.

use crate::ntfs::attributes::file_name::MAXIMUM_FILE_NAME_LENGTH;
use crate::ntfs::structures::utf16_len;
use strata_core::StrataError;

pub const PATH_SEPARATOR: char = '\\';

pub const MAXIMUM_VOLUME_LABEL_LENGTH: usize = 32;

const FORBIDDEN_NAME_CHARACTERS: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

pub fn validate_file_name(name: &str) -> Result<(), StrataError> {
    if name.is_empty() {
        return Err(StrataError::InvalidInput("file name is empty".to_string()));
    }
    if utf16_len(name) > MAXIMUM_FILE_NAME_LENGTH {
        return Err(StrataError::InvalidInput(format!(
            "file name of {} characters is longer than {}",
            utf16_len(name),
            MAXIMUM_FILE_NAME_LENGTH
        )));
    }
    if name == "." || name == ".." {
        return Err(StrataError::InvalidInput(format!("'{}' is not a valid file name", name)));
    }
    if let Some(c) = name
        .chars()
        .find(|c| (*c as u32) < 0x20 || FORBIDDEN_NAME_CHARACTERS.contains(c))
    {
        return Err(StrataError::InvalidInput(format!(
            "file name '{}' contains {:?}",
            name.escape_debug(),
            c
        )));
    }
    Ok(())
}

/// Labels are stored in `$VOLUME_NAME` and shown by the OS next to the drive
pub fn validate_volume_label(label: &str) -> Result<(), StrataError> {
    if utf16_len(label) > MAXIMUM_VOLUME_LABEL_LENGTH {
        return Err(StrataError::InvalidInput(format!(
            "volume label of {} characters is longer than {}",
            utf16_len(label),
            MAXIMUM_VOLUME_LABEL_LENGTH
        )));
    }
    if let Some(c) = label
        .chars()
        .find(|c| (*c as u32) < 0x20 || FORBIDDEN_NAME_CHARACTERS.contains(c))
    {
        return Err(StrataError::InvalidInput(format!("volume label contains {:?}", c)));
    }
    Ok(())
}

/// Split an absolute path into validated components. The root has none.
pub fn split_path(path: &str) -> Result<Vec<&str>, StrataError> {
    let Some(relative) = path.strip_prefix(PATH_SEPARATOR) else {
        return Err(StrataError::InvalidPath(format!("'{}' does not start at the root", path)));
    };
    if relative.is_empty() {
        return Ok(Vec::new());
    }
    let relative = relative.strip_suffix(PATH_SEPARATOR).unwrap_or(relative);
    let components: Vec<&str> = relative.split(PATH_SEPARATOR).collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(StrataError::InvalidPath(format!("'{}' has an empty component", path)));
    }
    for component in &components {
        validate_file_name(component)?;
    }
    Ok(components)
}

/// The directory components and the final name of a path naming a file
pub fn split_parent(path: &str) -> Result<(Vec<&str>, &str), StrataError> {
    let mut components = split_path(path)?;
    let name = components
        .pop()
        .ok_or_else(|| StrataError::InvalidPath("the root directory has no name".to_string()))?;
    Ok((components, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert!(split_path("\\").unwrap().is_empty());
        assert_eq!(split_path("\\A\\test.txt").unwrap(), vec!["A", "test.txt"]);
        assert_eq!(split_path("\\A\\").unwrap(), vec!["A"]);
        let (parent, name) = split_parent("\\A\\B\\c").unwrap();
        assert_eq!(parent, vec!["A", "B"]);
        assert_eq!(name, "c");
    }

    #[test]
    fn test_bad_syntax_is_invalid_path() {
        assert!(matches!(split_path("A\\b"), Err(StrataError::InvalidPath(_))));
        assert!(matches!(split_path("\\A\\\\b"), Err(StrataError::InvalidPath(_))));
        assert!(matches!(split_parent("\\"), Err(StrataError::InvalidPath(_))));
    }

    #[test]
    fn test_bad_names_are_invalid_input() {
        assert!(matches!(split_path("\\a:b"), Err(StrataError::InvalidInput(_))));
        assert!(matches!(split_path("\\.."), Err(StrataError::InvalidInput(_))));
        let long = "x".repeat(256);
        assert!(matches!(validate_file_name(&long), Err(StrataError::InvalidInput(_))));
        assert!(validate_file_name(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_volume_labels() {
        assert!(validate_volume_label("").is_ok());
        assert!(validate_volume_label("Backup Disk").is_ok());
        assert!(validate_volume_label(&"L".repeat(33)).is_err());
        assert!(validate_volume_label("a/b").is_err());
    }
}
