mod checksum;

pub use checksum::{sha256_file_hex, sha256_hex, tree_digest_hex, verify_sha256};
