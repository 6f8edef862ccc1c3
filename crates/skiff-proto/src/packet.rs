//! Packet definitions.
//!
//! Every packet starts with a `u32` packet id, followed by its fields
//! in the declared order. Ids are assigned in registration order and
//! are identical on both sides of the tunnel. Each request packet has
//! exactly one response, which is either its named success response,
//! `Ok`, `OSError`, `InvalidField`, or (for `ProcessRun` only)
//! `ProcessError`.

use crate::wire::{
    read_bool, read_bytes, read_i32, read_i64, read_opt, read_str, read_str_list, read_u32,
    read_u64, write_bool, write_bytes, write_i32, write_i64, write_opt, write_str, write_str_list,
    write_u32, write_u64, ProtoError,
};
use std::fmt;
use std::io::{Read, Write};

/// The type of a remote filesystem object as reported by `Stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatType {
    /// A directory.
    Dir,
    /// A character device.
    Chr,
    /// A block device.
    Blk,
    /// A regular file.
    File,
    /// A FIFO.
    Fifo,
    /// A symbolic link.
    Link,
    /// A unix socket.
    Sock,
    /// Anything else.
    Other,
}

impl StatType {
    /// The wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StatType::Dir => "dir",
            StatType::Chr => "chr",
            StatType::Blk => "blk",
            StatType::File => "file",
            StatType::Fifo => "fifo",
            StatType::Link => "link",
            StatType::Sock => "sock",
            StatType::Other => "other",
        }
    }

    fn from_wire(s: &str) -> StatType {
        match s {
            "dir" => StatType::Dir,
            "chr" => StatType::Chr,
            "blk" => StatType::Blk,
            "file" => StatType::File,
            "fifo" => StatType::Fifo,
            "link" => StatType::Link,
            "sock" => StatType::Sock,
            _ => StatType::Other,
        }
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tunnel packet. See the module docs for framing rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Generic successful status indicator.
    Ok,
    /// Acknowledges a previous `CheckAlive`.
    Ack,
    /// Handshake probe; the receiver must answer `Ack` immediately.
    CheckAlive,
    /// Tells the executor to close the connection and exit cleanly.
    Exit,
    /// An OS error occurred while handling the previous request.
    OsError {
        /// The remote errno.
        errno: i64,
        /// The rendered errno description.
        strerror: String,
        /// The full error message.
        msg: String,
    },
    /// A field of the previous request held an invalid value.
    InvalidField {
        /// The rejected field name.
        field: String,
        /// Why the value was rejected.
        error_message: String,
    },
    /// The result of a completed `ProcessRun`. A non-zero exit code is
    /// not an error at this layer.
    ProcessCompleted {
        /// Captured stdout, when capture was requested.
        stdout: Option<Vec<u8>>,
        /// Captured stderr, when capture was requested.
        stderr: Option<Vec<u8>>,
        /// The process exit code.
        returncode: i32,
    },
    /// A `ProcessRun` failed before or during spawn.
    ProcessError {
        /// The spawn failure message.
        message: String,
    },
    /// Runs a process on the remote.
    ProcessRun {
        /// The argv to execute.
        command: Vec<String>,
        /// Bytes fed to the child's stdin.
        stdin: Option<Vec<u8>>,
        /// Whether stdout/stderr should be captured.
        capture_output: bool,
        /// User (name or decimal uid) to run as; executor identity if absent.
        user: Option<String>,
        /// Group (name or decimal gid) to run as.
        group: Option<String>,
        /// Octal umask string; defaults to "077".
        umask: Option<String>,
        /// Working directory; must exist.
        cwd: Option<String>,
    },
    /// The result of a `Stat`.
    StatResult {
        /// Filesystem object type.
        file_type: StatType,
        /// Permission bits.
        mode: u64,
        /// Owning user name (or uid when unmapped).
        owner: String,
        /// Owning group name (or gid when unmapped).
        group: String,
        /// Size in bytes.
        size: u64,
        /// Modification time in nanoseconds.
        mtime: u64,
        /// Change time in nanoseconds.
        ctime: u64,
        /// SHA-512 of the content, when requested and a regular file.
        sha512sum: Option<Vec<u8>>,
    },
    /// Retrieves information about a path.
    Stat {
        /// The path to stat.
        path: String,
        /// Whether to resolve symlinks.
        follow_links: bool,
        /// Whether to hash regular file content.
        sha512sum: bool,
    },
    /// The result of a `ResolveUser`/`ResolveGroup`.
    ResolveResult {
        /// The canonical name.
        value: String,
    },
    /// Canonicalizes a user name or uid; the executor's own user if absent.
    ResolveUser {
        /// User name or decimal uid.
        user: Option<String>,
    },
    /// Canonicalizes a group name or gid; the executor's own group if absent.
    ResolveGroup {
        /// Group name or decimal gid.
        group: Option<String>,
    },
    /// Writes content to a remote file.
    Upload {
        /// Destination path.
        path: String,
        /// File content.
        content: Vec<u8>,
        /// Octal mode string; defaults to "600".
        mode: Option<String>,
        /// Owner to chown to.
        owner: Option<String>,
        /// Group to chown to.
        group: Option<String>,
    },
    /// The content of a downloaded file.
    DownloadResult {
        /// The file body.
        content: Vec<u8>,
    },
    /// Reads a remote file.
    Download {
        /// The path to read.
        path: String,
    },
    /// Detailed information about a user.
    UserEntry {
        /// The user name.
        name: String,
        /// The numerical user id.
        uid: i64,
        /// The name of the primary group.
        group: String,
        /// The numerical primary group id.
        gid: i64,
        /// Names of all supplementary groups.
        groups: Vec<String>,
        /// The password hash from shadow.
        password_hash: String,
        /// The GECOS comment field.
        gecos: String,
        /// The home directory.
        home: String,
        /// The login shell.
        shell: String,
    },
    /// Queries detailed information about a user.
    QueryUser {
        /// User name or decimal uid.
        user: String,
    },
    /// Detailed information about a group.
    GroupEntry {
        /// The group name.
        name: String,
        /// The numerical group id.
        gid: i64,
        /// Member user names.
        members: Vec<String>,
    },
    /// Queries detailed information about a group.
    QueryGroup {
        /// Group name or decimal gid.
        group: String,
    },
}

impl Packet {
    /// The wire id of this packet (assigned in registration order).
    #[must_use]
    pub fn id(&self) -> u32 {
        match self {
            Packet::Ok => 0,
            Packet::Ack => 1,
            Packet::CheckAlive => 2,
            Packet::Exit => 3,
            Packet::OsError { .. } => 4,
            Packet::InvalidField { .. } => 5,
            Packet::ProcessCompleted { .. } => 6,
            Packet::ProcessError { .. } => 7,
            Packet::ProcessRun { .. } => 8,
            Packet::StatResult { .. } => 9,
            Packet::Stat { .. } => 10,
            Packet::ResolveResult { .. } => 11,
            Packet::ResolveUser { .. } => 12,
            Packet::ResolveGroup { .. } => 13,
            Packet::Upload { .. } => 14,
            Packet::DownloadResult { .. } => 15,
            Packet::Download { .. } => 16,
            Packet::UserEntry { .. } => 17,
            Packet::QueryUser { .. } => 18,
            Packet::GroupEntry { .. } => 19,
            Packet::QueryGroup { .. } => 20,
        }
    }

    /// A short packet kind name for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Ok => "Ok",
            Packet::Ack => "Ack",
            Packet::CheckAlive => "CheckAlive",
            Packet::Exit => "Exit",
            Packet::OsError { .. } => "OSError",
            Packet::InvalidField { .. } => "InvalidField",
            Packet::ProcessCompleted { .. } => "ProcessCompleted",
            Packet::ProcessError { .. } => "ProcessError",
            Packet::ProcessRun { .. } => "ProcessRun",
            Packet::StatResult { .. } => "StatResult",
            Packet::Stat { .. } => "Stat",
            Packet::ResolveResult { .. } => "ResolveResult",
            Packet::ResolveUser { .. } => "ResolveUser",
            Packet::ResolveGroup { .. } => "ResolveGroup",
            Packet::Upload { .. } => "Upload",
            Packet::DownloadResult { .. } => "DownloadResult",
            Packet::Download { .. } => "Download",
            Packet::UserEntry { .. } => "UserEntry",
            Packet::QueryUser { .. } => "QueryUser",
            Packet::GroupEntry { .. } => "GroupEntry",
            Packet::QueryGroup { .. } => "QueryGroup",
        }
    }

    /// Serializes the packet (id, then fields in declared order) and
    /// flushes the writer, so a request is always fully on the wire
    /// before the sender blocks on the response.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), ProtoError> {
        write_u32(w, self.id())?;
        match self {
            Packet::Ok | Packet::Ack | Packet::CheckAlive | Packet::Exit => {}
            Packet::OsError {
                errno,
                strerror,
                msg,
            } => {
                write_i64(w, *errno)?;
                write_str(w, strerror)?;
                write_str(w, msg)?;
            }
            Packet::InvalidField {
                field,
                error_message,
            } => {
                write_str(w, field)?;
                write_str(w, error_message)?;
            }
            Packet::ProcessCompleted {
                stdout,
                stderr,
                returncode,
            } => {
                write_opt(w, stdout.as_deref(), |w, v| write_bytes(w, v))?;
                write_opt(w, stderr.as_deref(), |w, v| write_bytes(w, v))?;
                write_i32(w, *returncode)?;
            }
            Packet::ProcessError { message } => write_str(w, message)?,
            Packet::ProcessRun {
                command,
                stdin,
                capture_output,
                user,
                group,
                umask,
                cwd,
            } => {
                write_str_list(w, command)?;
                write_opt(w, stdin.as_deref(), |w, v| write_bytes(w, v))?;
                write_bool(w, *capture_output)?;
                write_opt(w, user.as_deref(), |w, v| write_str(w, v))?;
                write_opt(w, group.as_deref(), |w, v| write_str(w, v))?;
                write_opt(w, umask.as_deref(), |w, v| write_str(w, v))?;
                write_opt(w, cwd.as_deref(), |w, v| write_str(w, v))?;
            }
            Packet::StatResult {
                file_type,
                mode,
                owner,
                group,
                size,
                mtime,
                ctime,
                sha512sum,
            } => {
                write_str(w, file_type.as_str())?;
                write_u64(w, *mode)?;
                write_str(w, owner)?;
                write_str(w, group)?;
                write_u64(w, *size)?;
                write_u64(w, *mtime)?;
                write_u64(w, *ctime)?;
                write_opt(w, sha512sum.as_deref(), |w, v| write_bytes(w, v))?;
            }
            Packet::Stat {
                path,
                follow_links,
                sha512sum,
            } => {
                write_str(w, path)?;
                write_bool(w, *follow_links)?;
                write_bool(w, *sha512sum)?;
            }
            Packet::ResolveResult { value } => write_str(w, value)?,
            Packet::ResolveUser { user } => {
                write_opt(w, user.as_deref(), |w, v| write_str(w, v))?;
            }
            Packet::ResolveGroup { group } => {
                write_opt(w, group.as_deref(), |w, v| write_str(w, v))?;
            }
            Packet::Upload {
                path,
                content,
                mode,
                owner,
                group,
            } => {
                write_str(w, path)?;
                write_bytes(w, content)?;
                write_opt(w, mode.as_deref(), |w, v| write_str(w, v))?;
                write_opt(w, owner.as_deref(), |w, v| write_str(w, v))?;
                write_opt(w, group.as_deref(), |w, v| write_str(w, v))?;
            }
            Packet::DownloadResult { content } => write_bytes(w, content)?,
            Packet::Download { path } => write_str(w, path)?,
            Packet::UserEntry {
                name,
                uid,
                group,
                gid,
                groups,
                password_hash,
                gecos,
                home,
                shell,
            } => {
                write_str(w, name)?;
                write_i64(w, *uid)?;
                write_str(w, group)?;
                write_i64(w, *gid)?;
                write_str_list(w, groups)?;
                write_str(w, password_hash)?;
                write_str(w, gecos)?;
                write_str(w, home)?;
                write_str(w, shell)?;
            }
            Packet::QueryUser { user } => write_str(w, user)?,
            Packet::GroupEntry { name, gid, members } => {
                write_str(w, name)?;
                write_i64(w, *gid)?;
                write_str_list(w, members)?;
            }
            Packet::QueryGroup { group } => write_str(w, group)?,
        }
        Ok(w.flush()?)
    }

    /// Reads one packet from the stream. A short read or an unknown
    /// packet id is fatal to the session.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Packet, ProtoError> {
        let id = read_u32(r)?;
        Ok(match id {
            0 => Packet::Ok,
            1 => Packet::Ack,
            2 => Packet::CheckAlive,
            3 => Packet::Exit,
            4 => Packet::OsError {
                errno: read_i64(r)?,
                strerror: read_str(r)?,
                msg: read_str(r)?,
            },
            5 => Packet::InvalidField {
                field: read_str(r)?,
                error_message: read_str(r)?,
            },
            6 => Packet::ProcessCompleted {
                stdout: read_opt(r, read_bytes)?,
                stderr: read_opt(r, read_bytes)?,
                returncode: read_i32(r)?,
            },
            7 => Packet::ProcessError {
                message: read_str(r)?,
            },
            8 => Packet::ProcessRun {
                command: read_str_list(r)?,
                stdin: read_opt(r, read_bytes)?,
                capture_output: read_bool(r)?,
                user: read_opt(r, read_str)?,
                group: read_opt(r, read_str)?,
                umask: read_opt(r, read_str)?,
                cwd: read_opt(r, read_str)?,
            },
            9 => Packet::StatResult {
                file_type: StatType::from_wire(&read_str(r)?),
                mode: read_u64(r)?,
                owner: read_str(r)?,
                group: read_str(r)?,
                size: read_u64(r)?,
                mtime: read_u64(r)?,
                ctime: read_u64(r)?,
                sha512sum: read_opt(r, read_bytes)?,
            },
            10 => Packet::Stat {
                path: read_str(r)?,
                follow_links: read_bool(r)?,
                sha512sum: read_bool(r)?,
            },
            11 => Packet::ResolveResult {
                value: read_str(r)?,
            },
            12 => Packet::ResolveUser {
                user: read_opt(r, read_str)?,
            },
            13 => Packet::ResolveGroup {
                group: read_opt(r, read_str)?,
            },
            14 => Packet::Upload {
                path: read_str(r)?,
                content: read_bytes(r)?,
                mode: read_opt(r, read_str)?,
                owner: read_opt(r, read_str)?,
                group: read_opt(r, read_str)?,
            },
            15 => Packet::DownloadResult {
                content: read_bytes(r)?,
            },
            16 => Packet::Download {
                path: read_str(r)?,
            },
            17 => Packet::UserEntry {
                name: read_str(r)?,
                uid: read_i64(r)?,
                group: read_str(r)?,
                gid: read_i64(r)?,
                groups: read_str_list(r)?,
                password_hash: read_str(r)?,
                gecos: read_str(r)?,
                home: read_str(r)?,
                shell: read_str(r)?,
            },
            18 => Packet::QueryUser { user: read_str(r)? },
            19 => Packet::GroupEntry {
                name: read_str(r)?,
                gid: read_i64(r)?,
                members: read_str_list(r)?,
            },
            20 => Packet::QueryGroup {
                group: read_str(r)?,
            },
            other => return Err(ProtoError::UnknownPacketId(other)),
        })
    }

    /// Reads a response packet, converting the generic error replies
    /// (`OSError`, `InvalidField`) into typed errors.
    pub fn read_response<R: Read>(r: &mut R) -> Result<Packet, ProtoError> {
        match Packet::read_from(r)? {
            Packet::OsError {
                errno,
                strerror,
                msg,
            } => Err(ProtoError::RemoteOs {
                errno,
                strerror,
                msg,
            }),
            Packet::InvalidField {
                field,
                error_message,
            } => Err(ProtoError::InvalidField {
                field,
                message: error_message,
            }),
            packet => Ok(packet),
        }
    }
}
