use semver::Version;

/// Leading `(major, minor)` pair of a release string. Strict semver is tried
/// first; otherwise the first two dot-separated numeric prefixes are used and
/// anything unparsable counts as 0.
pub fn major_minor(version: &str) -> (u64, u64) {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    if let Ok(parsed) = Version::parse(trimmed) {
        return (parsed.major, parsed.minor);
    }

    let mut parts = trimmed.split('.').map(leading_number);
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor)
}

pub fn is_major_minor_change(current: &str, target: &str) -> bool {
    major_minor(current) != major_minor(target)
}

fn leading_number(part: &str) -> u64 {
    let digits: String = part.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}
