// 8.3 name conversion and path splitting

use fathom_core::{FsError, FsResult};

/// Normalized name → padded 11-byte 8.3 form, truncating the stem to 8
/// bytes and the extension to 3. Used for lookups, where over-long input
/// simply fails to match anything.
pub fn short_name_of(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };
    for (i, b) in stem.bytes().take(8).enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    out
}

/// Like `short_name_of`, but rejects names that do not fit 8.3. Used when
/// creating entries, where silent truncation would corrupt intent.
pub fn validated_short_name(name: &str) -> FsResult<[u8; 11]> {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };
    if stem.is_empty() || stem.len() > 8 || ext.len() > 3 {
        return Err(FsError::InvalidArgument(format!(
            "name {:?} does not fit the 8.3 form",
            name
        )));
    }
    if name.bytes().any(|b| b == b'/' || b == 0x00 || b == 0xE5) {
        return Err(FsError::InvalidArgument(format!(
            "name {:?} contains a forbidden byte",
            name
        )));
    }
    Ok(short_name_of(name))
}

/// 8.3 form → normalized name: both fields trimmed of padding, joined
/// with a dot only when the extension is nonempty.
pub fn normal_name_of(short: &[u8; 11]) -> String {
    let stem: String = short[..8]
        .iter()
        .take_while(|&&b| b != b' ' && b != 0)
        .map(|&b| b as char)
        .collect();
    let ext: String = short[8..]
        .iter()
        .take_while(|&&b| b != b' ' && b != 0)
        .map(|&b| b as char)
        .collect();
    if ext.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, ext)
    }
}

/// Case-insensitive comparison of a normalized name against an on-disk
/// 8.3 field, insensitive to padding differences.
pub fn matches_short_name(name: &str, short: &[u8; 11]) -> bool {
    let wanted = short_name_of(name);
    wanted
        .iter()
        .zip(short.iter())
        .all(|(a, b)| a.to_ascii_uppercase() == b.to_ascii_uppercase())
}

/// Split a path on `/`, dropping empty segments.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Split into (parent path, leaf name); the leaf must exist.
pub fn split_parent(path: &str) -> FsResult<(String, &str)> {
    let mut segments = split_path(path);
    let leaf = segments.pop().ok_or_else(|| {
        FsError::InvalidArgument(format!("path {:?} has no final component", path))
    })?;
    Ok((segments.join("/"), leaf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_pads_and_uppercases() {
        assert_eq!(&short_name_of("hello.txt"), b"HELLO   TXT");
        assert_eq!(&short_name_of("FOLDER"), b"FOLDER     ");
        assert_eq!(&short_name_of("a.b"), b"A       B  ");
    }

    #[test]
    fn short_form_truncates() {
        assert_eq!(&short_name_of("longfilename.jpeg"), b"LONGFILEJPE");
    }

    #[test]
    fn normal_form_round_trips() {
        assert_eq!(normal_name_of(b"HELLO   TXT"), "HELLO.TXT");
        assert_eq!(normal_name_of(b"FOLDER     "), "FOLDER");
        assert_eq!(normal_name_of(b"TEST    C  "), "TEST.C");
    }

    #[test]
    fn comparison_ignores_case_and_padding() {
        assert!(matches_short_name("hello.txt", b"HELLO   TXT"));
        assert!(matches_short_name("HELLO.TXT", b"HELLO   TXT"));
        assert!(!matches_short_name("hell.txt", b"HELLO   TXT"));
    }

    #[test]
    fn validation_rejects_oversized_names() {
        assert!(validated_short_name("README.TXT").is_ok());
        assert!(matches!(
            validated_short_name("longfilename.txt"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            validated_short_name("file.jpeg"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            validated_short_name(""),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn path_splitting_skips_empty_segments() {
        assert_eq!(split_path("/a//b/c/"), vec!["a", "b", "c"]);
        assert!(split_path("/").is_empty());
        let (parent, leaf) = split_parent("/a/b/c.txt").unwrap();
        assert_eq!(parent, "a/b");
        assert_eq!(leaf, "c.txt");
    }

    #[test]
    fn dotfile_has_no_extension_split() {
        // a leading dot belongs to the stem
        assert_eq!(&short_name_of(".cfg"), b".CFG       ");
    }
}
