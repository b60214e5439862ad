//! Filename normalization for the local staging directory.

/// Longest name accepted by common filesystems, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Turn an untrusted filename into something safe to join onto a staging dir.
///
/// The result never contains a path separator or `..`, and is never empty.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut safe = String::with_capacity(base.len());
    for c in base.chars() {
        match c {
            ' ' => safe.push('_'),
            // `..` must never survive, so runs of dots collapse to one
            '.' if safe.ends_with('.') => {}
            c if c.is_alphanumeric() || matches!(c, '-' | '.' | '@' | '(' | ')' | '_') => {
                safe.push(c)
            }
            _ => {}
        }
    }

    let safe = truncate_preserving_extension(safe, MAX_FILENAME_BYTES);

    if safe.is_empty() || safe == "." {
        generated_name()
    } else {
        safe
    }
}

fn generated_name() -> String {
    format!("file_{}", chrono::Utc::now().timestamp())
}

fn truncate_preserving_extension(name: String, max: usize) -> String {
    if name.len() <= max {
        return name;
    }

    let extension = match name.rfind('.') {
        Some(0) | None => "",
        Some(idx) => &name[idx..],
    };

    if extension.len() >= max / 2 {
        return floor_char_boundary(&name, max).to_string();
    }

    let stem = &name[..name.len() - extension.len()];
    let stem = floor_char_boundary(stem, max - extension.len()).trim_end_matches('.');
    format!("{stem}{extension}")
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn floor_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_confined(name: &str) {
        assert!(!name.is_empty());
        assert!(!name.contains('/'), "{name:?} contains a separator");
        assert!(!name.contains('\\'), "{name:?} contains a separator");
        assert!(!name.contains(".."), "{name:?} contains a parent reference");
        assert!(name.len() <= MAX_FILENAME_BYTES);
        assert!(std::path::Path::new(name).is_relative());
    }

    #[test]
    fn test_plain_names_pass_through() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("a-b_c@(1).tar.gz"), "a-b_c@(1).tar.gz");
        assert_eq!(sanitize_filename("Été.mkv"), "Été.mkv");
    }

    #[test]
    fn test_spaces_become_underscores() {
        assert_eq!(sanitize_filename("my holiday video.mp4"), "my_holiday_video.mp4");
    }

    #[test]
    fn test_strips_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("/var/log/syslog"), "syslog");
        assert_eq!(sanitize_filename("C:\\Users\\me\\movie.avi"), "movie.avi");
    }

    #[test]
    fn test_traversal_inputs_are_confined() {
        for input in [
            "..",
            "../",
            "foo/..",
            "..\\..\\boot.ini",
            "/",
            "/..",
            "a/b/c/...",
            "....hidden",
            "name..ext",
            "\u{0}\u{7}../x",
        ] {
            assert_confined(&sanitize_filename(input));
        }
        assert_eq!(sanitize_filename("name..ext"), "name.ext");
    }

    #[test]
    fn test_drops_special_and_control_characters() {
        assert_eq!(sanitize_filename("in\u{0}va\nlid<>:\"|?*.txt"), "invalid.txt");
        assert_eq!(sanitize_filename("rm -rf $HOME;.sh"), "rm_-rf_HOME.sh");
    }

    #[test]
    fn test_empty_results_get_generated_name() {
        for input in ["", "???", "/", "..", "."] {
            let name = sanitize_filename(input);
            assert!(name.starts_with("file_"), "{input:?} -> {name:?}");
            assert!(name["file_".len()..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_truncates_and_keeps_extension() {
        let long = format!("{}.mp4", "a".repeat(400));
        let name = sanitize_filename(&long);
        assert_eq!(name.len(), MAX_FILENAME_BYTES);
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        let long = format!("{}.txt", "é".repeat(200));
        let name = sanitize_filename(&long);
        assert!(name.len() <= MAX_FILENAME_BYTES);
        assert!(name.ends_with(".txt"));
        assert!(name.trim_end_matches(".txt").chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_truncation_never_joins_dots() {
        let long = format!("{}.{}.mkv", "a".repeat(250), "b".repeat(40));
        let name = sanitize_filename(&long);
        assert!(!name.contains(".."), "{name}");
        assert!(name.ends_with(".mkv"));
    }

    #[test]
    fn test_truncates_overlong_extension() {
        let long = format!("a.{}", "b".repeat(400));
        let name = sanitize_filename(&long);
        assert_eq!(name.len(), MAX_FILENAME_BYTES);
    }
}
