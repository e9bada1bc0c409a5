//! Store key layout.
//!
//! All shardkeeper state lives under a single root prefix:
//!
//! ```text
//! {root}/items/{item}             ItemSpec
//! {root}/items/{item}/{member}    AssignmentValue
//! {root}/members/{member}         MemberSpec, bound to the member's lease
//! {root}/leader                   identity of the allocator leader, bound to a lease
//! {root}/resources/{name}         underlying resources registered by storage nodes
//! ```
//!
//! Ids are percent-escaped so that `/` never appears within a single path segment.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// The default key space root.
pub const DEFAULT_ROOT: &str = "/shardkeeper";

const SEGMENT_ITEMS: &str = "items";
const SEGMENT_MEMBERS: &str = "members";
const SEGMENT_LEADER: &str = "leader";
const SEGMENT_RESOURCES: &str = "resources";

/// Characters left unescaped within a key segment.
const ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Escape an id for use as a single key segment.
pub fn escape(id: &str) -> String {
    utf8_percent_encode(id, ESCAPE_SET).to_string()
}

/// Unescape a key segment, returning `None` if it is not valid UTF-8 once decoded.
pub fn unescape(segment: &str) -> Option<String> {
    percent_decode_str(segment).decode_utf8().ok().map(|val| val.into_owned())
}

/// The decoded meaning of a key within the layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyKind {
    Item(String),
    Assignment { item: String, member: String },
    Member(String),
    Leader,
    Resource(String),
}

/// The key layout of a single allocation domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: String,
}

impl Layout {
    /// Create a new instance, normalizing the root to have a leading and no trailing `/`.
    pub fn new(root: impl AsRef<str>) -> Self {
        let trimmed = root.as_ref().trim_matches('/');
        Self { root: format!("/{}", trimmed) }
    }

    /// The root prefix of this layout.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The prefix covering every key of this layout.
    pub fn root_prefix(&self) -> String {
        format!("{}/", self.root)
    }

    pub fn items_prefix(&self) -> String {
        format!("{}/{}/", self.root, SEGMENT_ITEMS)
    }

    pub fn item_key(&self, item: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_ITEMS, escape(item))
    }

    /// The prefix under which all assignments of the given item live.
    pub fn assignments_prefix(&self, item: &str) -> String {
        format!("{}/", self.item_key(item))
    }

    pub fn assignment_key(&self, item: &str, member: &str) -> String {
        format!("{}/{}", self.item_key(item), escape(member))
    }

    pub fn members_prefix(&self) -> String {
        format!("{}/{}/", self.root, SEGMENT_MEMBERS)
    }

    pub fn member_key(&self, member: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_MEMBERS, escape(member))
    }

    pub fn leader_key(&self) -> String {
        format!("{}/{}", self.root, SEGMENT_LEADER)
    }

    pub fn resources_prefix(&self) -> String {
        format!("{}/{}/", self.root, SEGMENT_RESOURCES)
    }

    pub fn resource_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.root, SEGMENT_RESOURCES, escape(name))
    }

    /// Split the given key into its escaped path segments below the root.
    pub fn segments<'a>(&self, key: &'a str) -> Option<Vec<&'a str>> {
        let rest = key.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        if rest.is_empty() {
            return None;
        }
        Some(rest.split('/').collect())
    }

    /// Decode the given key according to this layout.
    pub fn parse(&self, key: &str) -> Option<KeyKind> {
        match self.segments(key)?.as_slice() {
            [SEGMENT_ITEMS, item] => Some(KeyKind::Item(unescape(item)?)),
            [SEGMENT_ITEMS, item, member] => Some(KeyKind::Assignment {
                item: unescape(item)?,
                member: unescape(member)?,
            }),
            [SEGMENT_MEMBERS, member] => Some(KeyKind::Member(unescape(member)?)),
            [SEGMENT_LEADER] => Some(KeyKind::Leader),
            [SEGMENT_RESOURCES, name] => Some(KeyKind::Resource(unescape(name)?)),
            _ => None,
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escaped_ids_never_contain_separators() {
        let layout = Layout::new("/shardkeeper/");
        let key = layout.assignment_key("logs/a b", "member/1");
        assert_eq!(key, "/shardkeeper/items/logs%2Fa%20b/member%2F1", "unexpected assignment key {}", key);
        let kind = layout.parse(&key);
        assert_eq!(
            kind,
            Some(KeyKind::Assignment {
                item: "logs/a b".into(),
                member: "member/1".into()
            }),
            "expected key to round trip, got {:?}",
            kind
        );
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        let layout = Layout::default();
        assert_eq!(layout.parse("/other/items/foo"), None);
        assert_eq!(layout.parse("/shardkeeper"), None);
        assert_eq!(layout.parse("/shardkeeperx/items/foo"), None);
        assert_eq!(layout.parse("/shardkeeper/items/foo/bar/baz"), None);
        assert_eq!(layout.parse("/shardkeeper/leader"), Some(KeyKind::Leader));
        assert_eq!(layout.parse("/shardkeeper/members/m-1"), Some(KeyKind::Member("m-1".into())));
    }
}
