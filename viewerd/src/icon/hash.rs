use sha2::{Sha256, Digest};

/// Prefix of every icon file name, keeping names valid resource identifiers
const ICON_FILE_PREFIX: &str = "i_";

/// Computes the lowercase hex SHA-256 of an icon URL.
pub fn url_hash(url: &str) -> String {
    let hash = Sha256::digest(url.as_bytes());
    hex::encode(hash)
}

/// File stem under which the icon for `url` is stored, e.g. "i_3fa9...".
pub fn icon_file_stem(url: &str) -> String {
    format!("{}{}", ICON_FILE_PREFIX, url_hash(url))
}

/// Maps a display density scale to the dimension tag used in storage paths.
pub fn density_name(scale: f32) -> &'static str {
    if scale >= 4.0 {
        "xxxhdpi"
    } else if scale >= 3.0 {
        "xxhdpi"
    } else if scale >= 2.0 {
        "xhdpi"
    } else if scale >= 1.5 {
        "hdpi"
    } else if scale >= 1.0 {
        "mdpi"
    } else {
        "ldpi"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let a = icon_file_stem("http://x/icon.png");
        let b = icon_file_stem("http://x/icon.png");
        assert_eq!(a, b);
        assert!(a.starts_with("i_"));
        assert_eq!(a.len(), 2 + 64);
        assert_eq!(a, a.to_lowercase());
    }

    #[test]
    fn test_hash_differs_per_url() {
        assert_ne!(url_hash("http://x/a.png"), url_hash("http://x/b.png"));
    }

    #[test]
    fn test_density_buckets() {
        assert_eq!(density_name(0.75), "ldpi");
        assert_eq!(density_name(1.0), "mdpi");
        assert_eq!(density_name(1.5), "hdpi");
        assert_eq!(density_name(2.0), "xhdpi");
        assert_eq!(density_name(3.0), "xxhdpi");
        assert_eq!(density_name(4.0), "xxxhdpi");
    }
}
