//! Key naming scheme
//!
//! Primary keys are namespaced by entity type so records of different kinds
//! can share one table. Secondary keys either name a record kind or point at
//! the target side of an edge using the same namespaces.
//!
//! | record                   | primary            | secondary                  |
//! |--------------------------|--------------------|----------------------------|
//! | declaration              | `declaration:{I}`  | `declaration:`             |
//! | group -> declaration     | `group:{G}`        | `declaration:{I}`          |
//! | group registry           | `group:`           | `group:{G}`                |
//! | enrollment -> group      | `enrollment:{E}`   | `group:{G}`                |
//! | manifest / tokens        | `enrollment:{E}`   | `manifest` / `tokens`      |
//! | raw status / value set   | `enrollment:{E}`   | `status:last` / `status:values` |
//! | status error entry       | `enrollment:{E}`   | `status:error:{path}:{ts}#{n}` |
//! | declaration status       | `enrollment:{E}`   | `status:declaration:{I}`   |

pub const DECLARATION: &str = "declaration:";
pub const GROUP: &str = "group:";
pub const ENROLLMENT: &str = "enrollment:";

pub const MANIFEST: &str = "manifest";
pub const TOKENS: &str = "tokens";
pub const STATUS_LAST: &str = "status:last";
pub const STATUS_VALUES: &str = "status:values";
pub const STATUS_ERROR: &str = "status:error:";
pub const STATUS_DECLARATION: &str = "status:declaration:";

/// The secondary key shared by every declaration record.
pub const DECLARATION_RECORD: &str = DECLARATION;

/// The primary key holding one registry entry per known group.
pub const GROUP_REGISTRY: &str = GROUP;

pub fn declaration(id: &str) -> String {
    format!("{}{}", DECLARATION, id)
}

pub fn group(name: &str) -> String {
    format!("{}{}", GROUP, name)
}

pub fn enrollment(id: &str) -> String {
    format!("{}{}", ENROLLMENT, id)
}

pub fn status_declaration(id: &str) -> String {
    format!("{}{}", STATUS_DECLARATION, id)
}

pub fn status_error(path: &str, timestamp: &str) -> String {
    format!("{}{}:{}", STATUS_ERROR, path, timestamp)
}

/// Strip a namespace from a key, returning the bare identifier.
pub fn strip<'a>(key: &'a str, namespace: &str) -> Option<&'a str> {
    key.strip_prefix(namespace)
}
