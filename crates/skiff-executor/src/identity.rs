//! User and group database access.
//!
//! Resolution accepts either a name or a decimal id, mirroring what
//! the usual command line tools accept. The shadow password hash and
//! supplementary group membership are read by parsing `/etc/shadow`
//! and `/etc/group` directly, since no safe wrapper exposes
//! enumeration of either database.

use nix::unistd::{Gid, Group, Uid, User};
use std::io;

/// Path of the shadow password database.
const SHADOW_PATH: &str = "/etc/shadow";
/// Path of the group database.
const GROUP_PATH: &str = "/etc/group";

/// A failed identity lookup, attributable to the offending field.
#[derive(Debug)]
pub struct LookupError {
    /// The message sent back in an `InvalidField` response.
    pub message: String,
}

impl LookupError {
    fn new(message: impl Into<String>) -> Self {
        LookupError {
            message: message.into(),
        }
    }
}

/// Resolves a user (name or decimal uid) to its passwd entry.
pub fn resolve_user(user: &str) -> Result<User, LookupError> {
    if let Ok(Some(pw)) = User::from_name(user) {
        return Ok(pw);
    }
    match user.parse::<u32>() {
        Ok(uid) => match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(pw)) => Ok(pw),
            _ => Err(LookupError::new(format!(
                "The user with the uid '{uid}' does not exist."
            ))),
        },
        Err(_) => Err(LookupError::new(format!(
            "The user with the name '{user}' does not exist."
        ))),
    }
}

/// Resolves a group (name or decimal gid) to its group entry.
pub fn resolve_group(group: &str) -> Result<Group, LookupError> {
    if let Ok(Some(gr)) = Group::from_name(group) {
        return Ok(gr);
    }
    match group.parse::<u32>() {
        Ok(gid) => match Group::from_gid(Gid::from_raw(gid)) {
            Ok(Some(gr)) => Ok(gr),
            _ => Err(LookupError::new(format!(
                "The group with the gid '{gid}' does not exist."
            ))),
        },
        Err(_) => Err(LookupError::new(format!(
            "The group with the name '{group}' does not exist."
        ))),
    }
}

/// Returns the name for a uid, falling back to the decimal id when the
/// uid has no passwd entry.
pub fn name_for_uid(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(pw)) => pw.name,
        _ => uid.to_string(),
    }
}

/// Returns the name for a gid, falling back to the decimal id when the
/// gid has no group entry.
pub fn name_for_gid(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(gr)) => gr.name,
        _ => gid.to_string(),
    }
}

/// Reads the shadow password hash for a user name. Returns `None`
/// when the database is unreadable or holds no entry.
pub fn shadow_hash(name: &str) -> Option<String> {
    let content = std::fs::read_to_string(SHADOW_PATH).ok()?;
    shadow_hash_from(&content, name)
}

/// Parses a shadow database for the given user's password hash.
pub(crate) fn shadow_hash_from(content: &str, name: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        (fields.next() == Some(name)).then(|| fields.next().unwrap_or("").to_owned())
    })
}

/// Names of all supplementary groups the user belongs to, aggregated
/// by scanning the group database.
pub fn supplementary_groups(name: &str) -> Result<Vec<String>, io::Error> {
    let content = std::fs::read_to_string(GROUP_PATH)?;
    Ok(supplementary_groups_from(&content, name))
}

/// Parses a group database for all groups listing the user as member.
pub(crate) fn supplementary_groups_from(content: &str, name: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(':');
            let group = fields.next()?;
            let members = fields.nth(2)?;
            members
                .split(',')
                .any(|m| m == name)
                .then(|| group.to_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADOW: &str = "\
root:$6$saltsalt$hashhash:19000:0:99999:7:::
daemon:*:19000:0:99999:7:::
deploy:!:19000:0:99999:7:::";

    const GROUPS: &str = "\
root:x:0:
wheel:x:10:alice,bob
video:x:27:alice
deploy:x:1000:";

    #[test]
    fn test_shadow_hash_lookup() {
        assert_eq!(
            shadow_hash_from(SHADOW, "root").as_deref(),
            Some("$6$saltsalt$hashhash")
        );
        assert_eq!(shadow_hash_from(SHADOW, "deploy").as_deref(), Some("!"));
        assert_eq!(shadow_hash_from(SHADOW, "nobody"), None);
    }

    #[test]
    fn test_supplementary_groups_scan() {
        assert_eq!(
            supplementary_groups_from(GROUPS, "alice"),
            vec!["wheel".to_owned(), "video".to_owned()]
        );
        assert_eq!(supplementary_groups_from(GROUPS, "bob"), vec!["wheel"]);
        assert!(supplementary_groups_from(GROUPS, "carol").is_empty());
    }

    #[test]
    fn test_resolve_current_user_by_uid_string() {
        let uid = nix::unistd::getuid().as_raw();
        let pw = resolve_user(&uid.to_string()).unwrap();
        assert_eq!(pw.uid.as_raw(), uid);
    }

    #[test]
    fn test_resolve_unknown_user() {
        let err = resolve_user("no-such-user-xyz").unwrap_err();
        assert!(err.message.contains("does not exist"));
    }

    #[test]
    fn test_name_for_unknown_uid_falls_back_to_number() {
        // Uid 4294967294 ("nobody minus one") is unassigned on any sane system.
        assert_eq!(name_for_uid(4_294_967_294), "4294967294");
    }
}
