//! redb table definitions for the embedded store.
//!
//! Redis data types are flattened into ordered tables. Members of a hash or
//! list live under `{key}\x1f{member}` so every member of one key sits in a
//! contiguous range that a prefix scan can walk.

use redb::TableDefinition;

/// Separator between a key and its member. Never appears in cache keys.
pub const MEMBER_SEP: char = '\u{1f}';

/// Hash fields keyed by `{key}\x1f{field}`.
pub const HASH_FIELDS: TableDefinition<&str, &str> = TableDefinition::new("hash_fields");

/// Plain string values keyed by `{key}`.
pub const STRINGS: TableDefinition<&str, &str> = TableDefinition::new("strings");

/// List entries keyed by `{key}\x1f{seq:020}`.
pub const LISTS: TableDefinition<&str, &str> = TableDefinition::new("lists");

/// Expiry deadline in unix seconds, keyed by `{key}`.
pub const EXPIRY: TableDefinition<&str, u64> = TableDefinition::new("expiry");

pub fn member_key(key: &str, member: &str) -> String {
    format!("{key}{MEMBER_SEP}{member}")
}

/// Half-open range covering every member of `key`.
pub fn member_range(key: &str) -> (String, String) {
    (format!("{key}\u{1f}"), format!("{key}\u{20}"))
}

pub fn member_name<'a>(key: &str, stored: &'a str) -> &'a str {
    &stored[key.len() + MEMBER_SEP.len_utf8()..]
}
