//! Identity resolution against a container's own user database.
//!
//! A user specifier is `uid[:gid]` or `name[:group]` (forms may be mixed,
//! e.g. `daemon:1`). Names are looked up in the container's `/etc/passwd`
//! and `/etc/group`, never the daemon's.

use execd_shared::errors::{ExecdError, ExecdResult};
use std::path::Path;

/// One line of a passwd file.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

/// One line of a group file.
#[derive(Clone, Debug, PartialEq, Eq)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

/// Default identity of a container's main process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

/// Effective identity of a launched process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    /// Home directory from the passwd entry, if the user has one.
    pub home: Option<String>,
}

/// Parsed `/etc/passwd` and `/etc/group` of a container.
#[derive(Clone, Debug, Default)]
pub struct UserDb {
    users: Vec<PasswdEntry>,
    groups: Vec<GroupEntry>,
}

impl UserDb {
    /// Load the user database below a container root filesystem.
    ///
    /// Missing files yield an empty database: numeric identities still
    /// resolve, names do not.
    pub fn load(rootfs: &Path) -> ExecdResult<Self> {
        let passwd = read_optional(&rootfs.join("etc/passwd"))?;
        let group = read_optional(&rootfs.join("etc/group"))?;
        Ok(Self::parse(&passwd, &group))
    }

    pub fn parse(passwd: &str, group: &str) -> Self {
        Self {
            users: passwd.lines().filter_map(parse_passwd_line).collect(),
            groups: group.lines().filter_map(parse_group_line).collect(),
        }
    }

    /// Resolve a user specifier.
    ///
    /// An empty specifier resolves to `default`. Numeric uids absent from
    /// passwd are accepted with gid 0, symbolic names must exist.
    pub fn resolve(&self, spec: &str, default: &ContainerUser) -> ExecdResult<Identity> {
        if spec.is_empty() {
            let entry = self.users.iter().find(|u| u.uid == default.uid);
            return Ok(Identity {
                uid: default.uid,
                gid: default.gid,
                additional_gids: default.additional_gids.clone(),
                home: entry.map(|e| e.home.clone()),
            });
        }

        let (user_part, group_part) = match spec.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (spec, None),
        };

        let (uid, entry) = self.lookup_user(user_part)?;

        let gid = match group_part {
            Some(group) if !group.is_empty() => self.lookup_group(group)?,
            _ => entry.map(|e| e.gid).unwrap_or(0),
        };

        let additional_gids = match entry {
            Some(e) => self
                .groups
                .iter()
                .filter(|g| g.gid != gid && g.members.iter().any(|m| m == &e.name))
                .map(|g| g.gid)
                .fold(Vec::new(), |mut acc, g| {
                    if !acc.contains(&g) {
                        acc.push(g);
                    }
                    acc
                }),
            None => Vec::new(),
        };

        Ok(Identity {
            uid,
            gid,
            additional_gids,
            home: Some(entry.map(|e| e.home.clone()).unwrap_or_else(|| "/".into())),
        })
    }

    /// Returns the uid and, when known, its passwd entry.
    fn lookup_user(&self, user: &str) -> ExecdResult<(u32, Option<&PasswdEntry>)> {
        if user.is_empty() {
            return Err(ExecdError::Identity("empty user name".to_string()));
        }
        match user.parse::<u32>() {
            Ok(uid) => Ok((uid, self.users.iter().find(|u| u.uid == uid))),
            Err(_) => self
                .users
                .iter()
                .find(|u| u.name == user)
                .map(|e| (e.uid, Some(e)))
                .ok_or_else(|| {
                    ExecdError::Identity(format!(
                        "unable to find user {}: no matching entries in passwd file",
                        user
                    ))
                }),
        }
    }

    fn lookup_group(&self, group: &str) -> ExecdResult<u32> {
        if let Ok(gid) = group.parse::<u32>() {
            return Ok(gid);
        }
        self.groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.gid)
            .ok_or_else(|| {
                ExecdError::Identity(format!(
                    "unable to find group {}: no matching entries in group file",
                    group
                ))
            })
    }
}

fn read_optional(path: &Path) -> ExecdResult<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ExecdError::Identity(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// `name:password:uid:gid:gecos:home:shell`
fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 4 {
        return None;
    }
    Some(PasswdEntry {
        name: parts[0].to_string(),
        uid: parts[2].parse().ok()?,
        gid: parts[3].parse().ok()?,
        home: parts.get(5).copied().unwrap_or("/").to_string(),
    })
}

/// `name:password:gid:member1,member2`
fn parse_group_line(line: &str) -> Option<GroupEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 3 {
        return None;
    }
    let members = parts
        .get(3)
        .map(|m| {
            m.split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(GroupEntry {
        name: parts[0].to_string(),
        gid: parts[2].parse().ok()?,
        members,
    })
}
