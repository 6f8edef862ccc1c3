//! Per-host sessions.
//!
//! A [`Connection`] owns a connector plus the host's base settings. On
//! open it resolves the user and group the remote executor actually
//! runs as and installs them into the base settings, so that
//! "defaults" always reflect reality rather than an assumption.

use crate::connector::Connector;
use crate::error::ConnectError;
use skiff_core::{RemoteSettings, SettingsError};
use skiff_proto::{Packet, ProtoError, StatType};
use tracing::debug;

/// A finished remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCommand {
    /// Captured stdout, when capture was requested.
    pub stdout: Option<Vec<u8>>,
    /// Captured stderr, when capture was requested.
    pub stderr: Option<Vec<u8>>,
    /// The exit code.
    pub returncode: i32,
}

impl CompletedCommand {
    /// Stdout decoded as UTF-8 (lossy) with surrounding whitespace
    /// trimmed; the usual shape needed when parsing tool output.
    #[must_use]
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(self.stdout.as_deref().unwrap_or_default())
            .trim()
            .to_owned()
    }
}

/// Information about a remote filesystem object. `mode` is an octal
/// string, matching how modes travel everywhere else in skiff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    /// The object type.
    pub file_type: StatType,
    /// Permission bits as an octal string.
    pub mode: String,
    /// Owning user name.
    pub owner: String,
    /// Owning group name.
    pub group: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds.
    pub mtime: u64,
    /// Change time in nanoseconds.
    pub ctime: u64,
    /// SHA-512 of the content, when requested.
    pub sha512sum: Option<Vec<u8>>,
}

/// The result of a user query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    /// The user name.
    pub name: String,
    /// The numerical user id.
    pub uid: i64,
    /// The name of the primary group.
    pub group: String,
    /// The numerical primary group id.
    pub gid: i64,
    /// Names of all supplementary groups.
    pub groups: Vec<String>,
    /// The password hash from shadow.
    pub password_hash: String,
    /// The GECOS comment field.
    pub gecos: String,
    /// The home directory.
    pub home: String,
    /// The login shell.
    pub shell: String,
}

/// The result of a group query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    /// The group name.
    pub name: String,
    /// The numerical group id.
    pub gid: i64,
    /// Member user names.
    pub members: Vec<String>,
}

/// Options for [`Connection::run`]. The identity/umask/cwd fields are
/// the *effective* values for this invocation; callers overlay their
/// defaults stack before filling them in.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Bytes fed to the remote command's stdin.
    pub input: Option<Vec<u8>>,
    /// Whether to capture stdout/stderr.
    pub capture_output: bool,
    /// Whether a non-zero exit should be an error.
    pub check: bool,
    /// User to run as.
    pub user: Option<String>,
    /// Group to run as.
    pub group: Option<String>,
    /// Umask as an octal string.
    pub umask: Option<String>,
    /// Remote working directory.
    pub cwd: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            input: None,
            capture_output: true,
            check: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        }
    }
}

impl RunOptions {
    /// Fills the identity/umask/cwd fields from the given effective
    /// settings, keeping explicit values.
    #[must_use]
    pub fn with_defaults(mut self, defaults: &RemoteSettings) -> RunOptions {
        self.user = self.user.or_else(|| defaults.as_user.clone());
        self.group = self.group.or_else(|| defaults.as_group.clone());
        self.umask = self.umask.or_else(|| defaults.umask.clone());
        self.cwd = self.cwd.or_else(|| defaults.cwd.clone());
        self
    }
}

/// The base settings a connection starts from before the remote
/// identity is known.
fn initial_base_settings() -> RemoteSettings {
    RemoteSettings {
        as_user: Some("root".to_owned()),
        as_group: Some("root".to_owned()),
        owner: Some("root".to_owned()),
        group: Some("root".to_owned()),
        file_mode: Some("600".to_owned()),
        dir_mode: Some("700".to_owned()),
        umask: Some("077".to_owned()),
        cwd: Some("/tmp".to_owned()),
    }
}

/// A live session with one host.
pub struct Connection {
    connector: Box<dyn Connector>,
    base_settings: RemoteSettings,
}

impl Connection {
    /// Opens the connector, resolves the remote identity, and returns
    /// the ready connection.
    pub fn open(mut connector: Box<dyn Connector>) -> Result<Connection, ConnectError> {
        connector.open()?;
        let mut conn = Connection {
            connector,
            base_settings: initial_base_settings(),
        };

        // Query the identity we actually operate as, so the base
        // settings reflect reality.
        let user = conn.resolve_user(None)?;
        let group = conn.resolve_group(None)?;
        debug!(%user, %group, "resolved remote identity");
        conn.base_settings.as_user = Some(user.clone());
        conn.base_settings.as_group = Some(group.clone());
        conn.base_settings.owner = Some(user);
        conn.base_settings.group = Some(group);
        Ok(conn)
    }

    /// The settings this connection operates under by default.
    #[must_use]
    pub fn base_settings(&self) -> &RemoteSettings {
        &self.base_settings
    }

    /// Closes the connection. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), ConnectError> {
        self.connector.close()
    }

    fn unexpected(expected: &'static str, got: &Packet) -> ConnectError {
        ConnectError::Proto(ProtoError::UnexpectedResponse {
            expected,
            got: got.kind(),
        })
    }

    /// Runs a command on the remote host. With `check` set, a
    /// non-zero exit becomes [`ConnectError::CommandFailed`].
    pub fn run(
        &mut self,
        command: &[String],
        opts: RunOptions,
    ) -> Result<CompletedCommand, ConnectError> {
        let response = self.connector.request(&Packet::ProcessRun {
            command: command.to_vec(),
            stdin: opts.input,
            capture_output: opts.capture_output,
            user: opts.user,
            group: opts.group,
            umask: opts.umask,
            cwd: opts.cwd,
        })?;
        let result = match response {
            Packet::ProcessCompleted {
                stdout,
                stderr,
                returncode,
            } => CompletedCommand {
                stdout,
                stderr,
                returncode,
            },
            Packet::ProcessError { message } => {
                return Err(ConnectError::Proto(ProtoError::Process(message)))
            }
            other => return Err(Self::unexpected("ProcessCompleted", &other)),
        };

        if opts.check && result.returncode != 0 {
            return Err(ConnectError::CommandFailed {
                command: command.to_vec(),
                stdout: result.stdout,
                stderr: result.stderr,
                returncode: result.returncode,
            });
        }
        Ok(result)
    }

    /// Stats a remote path, returning `None` when it does not exist.
    pub fn stat(
        &mut self,
        path: &str,
        follow_links: bool,
        sha512sum: bool,
    ) -> Result<Option<StatEntry>, ConnectError> {
        let response = self.connector.request(&Packet::Stat {
            path: path.to_owned(),
            follow_links,
            sha512sum,
        });
        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match response {
            Packet::StatResult {
                file_type,
                mode,
                owner,
                group,
                size,
                mtime,
                ctime,
                sha512sum,
            } => Ok(Some(StatEntry {
                file_type,
                mode: format!("{mode:o}"),
                owner,
                group,
                size,
                mtime,
                ctime,
                sha512sum,
            })),
            other => Err(Self::unexpected("StatResult", &other)),
        }
    }

    /// Canonicalizes a user name or uid; the remote identity when
    /// `None` is given.
    pub fn resolve_user(&mut self, user: Option<&str>) -> Result<String, ConnectError> {
        let response = self.connector.request(&Packet::ResolveUser {
            user: user.map(str::to_owned),
        })?;
        match response {
            Packet::ResolveResult { value } => Ok(value),
            other => Err(Self::unexpected("ResolveResult", &other)),
        }
    }

    /// Canonicalizes a group name or gid; the remote identity when
    /// `None` is given.
    pub fn resolve_group(&mut self, group: Option<&str>) -> Result<String, ConnectError> {
        let response = self.connector.request(&Packet::ResolveGroup {
            group: group.map(str::to_owned),
        })?;
        match response {
            Packet::ResolveResult { value } => Ok(value),
            other => Err(Self::unexpected("ResolveResult", &other)),
        }
    }

    /// Queries detailed information about a user.
    pub fn query_user(&mut self, user: &str) -> Result<UserEntry, ConnectError> {
        let response = self.connector.request(&Packet::QueryUser {
            user: user.to_owned(),
        })?;
        match response {
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
            } => Ok(UserEntry {
                name,
                uid,
                group,
                gid,
                groups,
                password_hash,
                gecos,
                home,
                shell,
            }),
            other => Err(Self::unexpected("UserEntry", &other)),
        }
    }

    /// Like [`Connection::query_user`], but a nonexistent user yields
    /// `None` instead of an error.
    pub fn query_user_opt(&mut self, user: &str) -> Result<Option<UserEntry>, ConnectError> {
        match self.query_user(user) {
            Ok(entry) => Ok(Some(entry)),
            Err(ConnectError::Proto(ProtoError::InvalidField { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Queries detailed information about a group.
    pub fn query_group(&mut self, group: &str) -> Result<GroupEntry, ConnectError> {
        let response = self.connector.request(&Packet::QueryGroup {
            group: group.to_owned(),
        })?;
        match response {
            Packet::GroupEntry { name, gid, members } => Ok(GroupEntry { name, gid, members }),
            other => Err(Self::unexpected("GroupEntry", &other)),
        }
    }

    /// Like [`Connection::query_group`], but a nonexistent group
    /// yields `None` instead of an error.
    pub fn query_group_opt(&mut self, group: &str) -> Result<Option<GroupEntry>, ConnectError> {
        match self.query_group(group) {
            Ok(entry) => Ok(Some(entry)),
            Err(ConnectError::Proto(ProtoError::InvalidField { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes content to a remote file.
    pub fn upload(
        &mut self,
        path: &str,
        content: Vec<u8>,
        mode: Option<String>,
        owner: Option<String>,
        group: Option<String>,
    ) -> Result<(), ConnectError> {
        let response = self.connector.request(&Packet::Upload {
            path: path.to_owned(),
            content,
            mode,
            owner,
            group,
        })?;
        match response {
            Packet::Ok => Ok(()),
            other => Err(Self::unexpected("Ok", &other)),
        }
    }

    /// Reads a remote file. A nonexistent file is an error; see
    /// [`Connection::download_or`].
    pub fn download(&mut self, path: &str) -> Result<Vec<u8>, ConnectError> {
        let response = self.connector.request(&Packet::Download {
            path: path.to_owned(),
        })?;
        match response {
            Packet::DownloadResult { content } => Ok(content),
            other => Err(Self::unexpected("DownloadResult", &other)),
        }
    }

    /// Like [`Connection::download`], but a nonexistent file yields
    /// the given default.
    pub fn download_or(
        &mut self,
        path: &str,
        default: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>, ConnectError> {
        match self.download(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(default),
            Err(e) => Err(e),
        }
    }

    /// Validates and resolves the given (already overlaid) settings
    /// against this connection: octal masks are checked, user, group
    /// and owner are canonicalized remotely, and a configured cwd must
    /// exist and be a directory. This is the single point at which
    /// logical defaults become physically effective.
    pub fn resolve_defaults(
        &mut self,
        settings: &RemoteSettings,
    ) -> Result<RemoteSettings, ConnectError> {
        let mut settings = settings.canonicalized()?;

        let masks = [
            ("file_mode", settings.file_mode.is_some()),
            ("dir_mode", settings.dir_mode.is_some()),
            ("umask", settings.umask.is_some()),
        ];
        if let Some((field, _)) = masks.into_iter().find(|(_, present)| !present) {
            return Err(ConnectError::Settings(SettingsError::MissingField {
                field,
            }));
        }

        if let Some(user) = settings.as_user.take() {
            settings.as_user = Some(self.resolve_user(Some(&user))?);
        }
        if let Some(group) = settings.as_group.take() {
            settings.as_group = Some(self.resolve_group(Some(&group))?);
        }
        if let Some(owner) = settings.owner.take() {
            settings.owner = Some(self.resolve_user(Some(&owner))?);
        }
        if let Some(group) = settings.group.take() {
            settings.group = Some(self.resolve_group(Some(&group))?);
        }

        if let Some(cwd) = settings.cwd.clone() {
            match self.stat(&cwd, true, false)? {
                None => {
                    return Err(ConnectError::BadWorkingDirectory {
                        cwd,
                        problem: "doesn't exist",
                    })
                }
                Some(entry) if entry.file_type != StatType::Dir => {
                    return Err(ConnectError::BadWorkingDirectory {
                        cwd,
                        problem: "is not a directory",
                    })
                }
                Some(_) => {}
            }
        }

        Ok(settings)
    }
}
