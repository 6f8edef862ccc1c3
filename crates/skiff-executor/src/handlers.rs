//! Request packet handlers.
//!
//! Each handler performs one privileged primitive and produces exactly
//! one response packet. OS-level failures bubble up as `io::Error` and
//! are converted into `OSError` responses by the serve loop, which
//! keeps serving afterwards.

use crate::identity;
use nix::sys::stat::{self, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use sha2::{Digest, Sha512};
use skiff_proto::{Packet, StatType};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Parses an octal mode string, or produces the canonical complaint.
fn resolve_oct(value: &str) -> Result<u32, String> {
    u32::from_str_radix(value, 8)
        .map_err(|_| format!("Invalid value '{value}': Must be in octal format."))
}

fn invalid_field(field: &str, message: impl Into<String>) -> Packet {
    Packet::InvalidField {
        field: field.to_owned(),
        error_message: message.into(),
    }
}

/// Dispatches one request packet. `Exit` and `CheckAlive` are handled
/// by the serve loop and never reach this function.
pub fn handle(packet: Packet) -> Result<Packet, io::Error> {
    match packet {
        Packet::ProcessRun {
            command,
            stdin,
            capture_output,
            user,
            group,
            umask,
            cwd,
        } => process_run(&command, stdin.as_deref(), capture_output, user, group, umask, cwd),
        Packet::Stat {
            path,
            follow_links,
            sha512sum,
        } => stat_path(&path, follow_links, sha512sum),
        Packet::ResolveUser { user } => resolve_user_packet(user),
        Packet::ResolveGroup { group } => resolve_group_packet(group),
        Packet::QueryUser { user } => query_user(&user),
        Packet::QueryGroup { group } => query_group(&group),
        Packet::Upload {
            path,
            content,
            mode,
            owner,
            group,
        } => upload(&path, &content, mode, owner, group),
        Packet::Download { path } => download(&path),
        other => Ok(invalid_field(
            "packet",
            format!("'{}' is not a request packet", other.kind()),
        )),
    }
}

#[allow(clippy::too_many_arguments)]
fn process_run(
    command: &[String],
    stdin: Option<&[u8]>,
    capture_output: bool,
    user: Option<String>,
    group: Option<String>,
    umask: Option<String>,
    cwd: Option<String>,
) -> Result<Packet, io::Error> {
    // By default commands run as the executor's own identity.
    let mut uid: Option<u32> = None;
    let mut gid: Option<u32> = None;
    let mut umask_oct = 0o077;

    if let Some(umask) = umask.as_deref() {
        match resolve_oct(umask) {
            Ok(v) => umask_oct = v,
            Err(e) => return Ok(invalid_field("umask", e)),
        }
    }

    if let Some(user) = user.as_deref() {
        match identity::resolve_user(user) {
            Ok(pw) => {
                uid = Some(pw.uid.as_raw());
                gid = Some(pw.gid.as_raw());
            }
            Err(e) => return Ok(invalid_field("user", e.message)),
        }
    }

    if let Some(group) = group.as_deref() {
        match identity::resolve_group(group) {
            Ok(gr) => gid = Some(gr.gid.as_raw()),
            Err(e) => return Ok(invalid_field("group", e.message)),
        }
    }

    if let Some(cwd) = cwd.as_deref() {
        if !Path::new(cwd).is_dir() {
            return Ok(invalid_field("cwd", "The directory does not exist"));
        }
    }

    let Some((argv0, args)) = command.split_first() else {
        return Ok(Packet::ProcessError {
            message: "empty command".to_owned(),
        });
    };

    let mut cmd = Command::new(argv0);
    cmd.args(args);
    if let Some(cwd) = cwd.as_deref() {
        cmd.current_dir(cwd);
    }
    if let Some(gid) = gid {
        cmd.gid(gid);
    }
    if let Some(uid) = uid {
        cmd.uid(uid);
    }
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    // stdout of this process carries the packet stream, so a child
    // must never inherit it.
    if capture_output {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
    }

    // The executor is single threaded, so temporarily switching our
    // own umask around the spawn is race free and avoids a pre-exec
    // hook.
    let previous_umask = stat::umask(Mode::from_bits_truncate(umask_oct));
    let spawned = cmd.spawn();
    stat::umask(previous_umask);

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return Ok(Packet::ProcessError {
                message: e.to_string(),
            })
        }
    };

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A child that exits early closes the pipe; that is not an
        // error for the command contract.
        let _ = pipe.write_all(input);
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            return Ok(Packet::ProcessError {
                message: e.to_string(),
            })
        }
    };

    let returncode = output
        .status
        .code()
        .unwrap_or_else(|| -output.status.signal().unwrap_or(0));
    debug!(returncode, "process completed");

    Ok(Packet::ProcessCompleted {
        stdout: capture_output.then_some(output.stdout),
        stderr: capture_output.then_some(output.stderr),
        returncode,
    })
}

fn stat_path(path: &str, follow_links: bool, sha512sum: bool) -> Result<Packet, io::Error> {
    let st = if follow_links {
        stat::stat(path)
    } else {
        stat::lstat(path)
    };
    let st = match st {
        Ok(st) => st,
        Err(nix::errno::Errno::ENOENT) => {
            return Ok(invalid_field("path", format!("'{path}' does not exist")))
        }
        Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
    };

    let file_type = match SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT {
        SFlag::S_IFDIR => StatType::Dir,
        SFlag::S_IFCHR => StatType::Chr,
        SFlag::S_IFBLK => StatType::Blk,
        SFlag::S_IFREG => StatType::File,
        SFlag::S_IFIFO => StatType::Fifo,
        SFlag::S_IFLNK => StatType::Link,
        SFlag::S_IFSOCK => StatType::Sock,
        _ => StatType::Other,
    };

    let sha512sum = if sha512sum && file_type == StatType::File {
        let content = std::fs::read(path)?;
        Some(Sha512::digest(&content).to_vec())
    } else {
        None
    };

    #[allow(clippy::cast_sign_loss)]
    let (size, mtime, ctime) = (
        st.st_size as u64,
        (st.st_mtime as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(st.st_mtime_nsec as u64),
        (st.st_ctime as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(st.st_ctime_nsec as u64),
    );

    Ok(Packet::StatResult {
        file_type,
        mode: u64::from(st.st_mode & 0o7777),
        owner: identity::name_for_uid(st.st_uid),
        group: identity::name_for_gid(st.st_gid),
        size,
        mtime,
        ctime,
        sha512sum,
    })
}

fn resolve_user_packet(user: Option<String>) -> Result<Packet, io::Error> {
    let user = user.unwrap_or_else(|| nix::unistd::getuid().as_raw().to_string());
    match identity::resolve_user(&user) {
        Ok(pw) => Ok(Packet::ResolveResult { value: pw.name }),
        Err(_) => Ok(invalid_field("user", "The user does not exist")),
    }
}

fn resolve_group_packet(group: Option<String>) -> Result<Packet, io::Error> {
    let group = group.unwrap_or_else(|| nix::unistd::getgid().as_raw().to_string());
    match identity::resolve_group(&group) {
        Ok(gr) => Ok(Packet::ResolveResult { value: gr.name }),
        Err(_) => Ok(invalid_field("group", "The group does not exist")),
    }
}

fn query_user(user: &str) -> Result<Packet, io::Error> {
    let pw = match identity::resolve_user(user) {
        Ok(pw) => pw,
        Err(_) => return Ok(invalid_field("user", "The user does not exist")),
    };

    let Some(password_hash) = identity::shadow_hash(&pw.name) else {
        return Ok(invalid_field(
            "user",
            "The user has no shadow entry, or it is inaccessible.",
        ));
    };

    let group = match nix::unistd::Group::from_gid(pw.gid) {
        Ok(Some(gr)) => gr.name,
        _ => {
            return Ok(invalid_field(
                "user",
                "The user's primary group doesn't exist",
            ))
        }
    };

    Ok(Packet::UserEntry {
        name: pw.name.clone(),
        uid: i64::from(pw.uid.as_raw()),
        group,
        gid: i64::from(pw.gid.as_raw()),
        groups: identity::supplementary_groups(&pw.name)?,
        password_hash,
        gecos: pw.gecos.to_string_lossy().into_owned(),
        home: pw.dir.to_string_lossy().into_owned(),
        shell: pw.shell.to_string_lossy().into_owned(),
    })
}

fn query_group(group: &str) -> Result<Packet, io::Error> {
    match identity::resolve_group(group) {
        Ok(gr) => Ok(Packet::GroupEntry {
            name: gr.name,
            gid: i64::from(gr.gid.as_raw()),
            members: gr.mem,
        }),
        Err(_) => Ok(invalid_field("group", "The group does not exist")),
    }
}

fn upload(
    path: &str,
    content: &[u8],
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
) -> Result<Packet, io::Error> {
    let mut mode_oct = 0o600;
    let mut uid: Option<Uid> = None;
    let mut gid: Option<Gid> = None;

    if let Some(mode) = mode.as_deref() {
        match resolve_oct(mode) {
            Ok(v) => mode_oct = v,
            Err(e) => return Ok(invalid_field("mode", e)),
        }
    }
    if let Some(owner) = owner.as_deref() {
        match identity::resolve_user(owner) {
            Ok(pw) => {
                uid = Some(pw.uid);
                gid = Some(pw.gid);
            }
            Err(e) => return Ok(invalid_field("owner", e.message)),
        }
    }
    if let Some(group) = group.as_deref() {
        match identity::resolve_group(group) {
            Ok(gr) => gid = Some(gr.gid),
            Err(e) => return Ok(invalid_field("group", e.message)),
        }
    }

    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode_oct))?;
    if uid.is_some() || gid.is_some() {
        chown(path, uid, gid).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    }

    Ok(Packet::Ok)
}

fn download(path: &str) -> Result<Packet, io::Error> {
    match std::fs::read(path) {
        Ok(content) => Ok(Packet::DownloadResult { content }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Ok(invalid_field("path", format!("'{path}' does not exist")))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run_simple(command: &[&str]) -> Packet {
        handle(Packet::ProcessRun {
            command: command.iter().map(|s| (*s).to_owned()).collect(),
            stdin: None,
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        })
        .unwrap()
    }

    #[test]
    fn test_process_run_captures_output() {
        match run_simple(&["echo", "hello"]) {
            Packet::ProcessCompleted {
                stdout, returncode, ..
            } => {
                assert_eq!(stdout.as_deref(), Some(b"hello\n".as_slice()));
                assert_eq!(returncode, 0);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_process_run_nonzero_exit_is_not_an_error() {
        match run_simple(&["false"]) {
            Packet::ProcessCompleted { returncode, .. } => assert_eq!(returncode, 1),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_process_run_stdin() {
        let response = handle(Packet::ProcessRun {
            command: vec!["cat".into()],
            stdin: Some(b"fed via stdin".to_vec()),
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: None,
        })
        .unwrap();
        match response {
            Packet::ProcessCompleted { stdout, .. } => {
                assert_eq!(stdout.as_deref(), Some(b"fed via stdin".as_slice()));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_process_run_invalid_umask() {
        let response = handle(Packet::ProcessRun {
            command: vec!["true".into()],
            stdin: None,
            capture_output: true,
            user: None,
            group: None,
            umask: Some("8xx".into()),
            cwd: None,
        })
        .unwrap();
        match response {
            Packet::InvalidField { field, .. } => assert_eq!(field, "umask"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_process_run_missing_cwd() {
        let response = handle(Packet::ProcessRun {
            command: vec!["true".into()],
            stdin: None,
            capture_output: true,
            user: None,
            group: None,
            umask: None,
            cwd: Some("/definitely/not/a/dir".into()),
        })
        .unwrap();
        match response {
            Packet::InvalidField { field, .. } => assert_eq!(field, "cwd"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_process_run_spawn_failure() {
        match run_simple(&["/no/such/binary"]) {
            Packet::ProcessError { .. } => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_stat_missing_path() {
        let response = handle(Packet::Stat {
            path: "/no/such/path".into(),
            follow_links: false,
            sha512sum: false,
        })
        .unwrap();
        match response {
            Packet::InvalidField { field, .. } => assert_eq!(field, "path"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_stat_reports_type_and_mode() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"content").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();

        let response = handle(Packet::Stat {
            path: file.to_string_lossy().into_owned(),
            follow_links: false,
            sha512sum: true,
        })
        .unwrap();
        match response {
            Packet::StatResult {
                file_type,
                mode,
                size,
                sha512sum,
                ..
            } => {
                assert_eq!(file_type, StatType::File);
                assert_eq!(mode, 0o640);
                assert_eq!(size, 7);
                assert_eq!(sha512sum.unwrap(), Sha512::digest(b"content").to_vec());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_stat_symlink_vs_follow() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        std::fs::write(&target, b"x").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let lstat = handle(Packet::Stat {
            path: link.to_string_lossy().into_owned(),
            follow_links: false,
            sha512sum: false,
        })
        .unwrap();
        let followed = handle(Packet::Stat {
            path: link.to_string_lossy().into_owned(),
            follow_links: true,
            sha512sum: false,
        })
        .unwrap();
        match (lstat, followed) {
            (
                Packet::StatResult { file_type: a, .. },
                Packet::StatResult { file_type: b, .. },
            ) => {
                assert_eq!(a, StatType::Link);
                assert_eq!(b, StatType::File);
            }
            other => panic!("unexpected responses: {other:?}"),
        }
    }

    #[test]
    fn test_upload_then_download_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploaded").to_string_lossy().into_owned();

        let response = handle(Packet::Upload {
            path: path.clone(),
            content: b"a\n".to_vec(),
            mode: Some("600".into()),
            owner: None,
            group: None,
        })
        .unwrap();
        assert_eq!(response, Packet::Ok);

        match handle(Packet::Download { path }).unwrap() {
            Packet::DownloadResult { content } => assert_eq!(content, b"a\n"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_upload_sets_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("modefile");
        handle(Packet::Upload {
            path: path.to_string_lossy().into_owned(),
            content: vec![],
            mode: Some("640".into()),
            owner: None,
            group: None,
        })
        .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn test_upload_invalid_mode() {
        let response = handle(Packet::Upload {
            path: "/tmp/never-written".into(),
            content: vec![],
            mode: Some("rw-".into()),
            owner: None,
            group: None,
        })
        .unwrap();
        match response {
            Packet::InvalidField { field, .. } => assert_eq!(field, "mode"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_download_missing_file() {
        let response = handle(Packet::Download {
            path: "/no/such/file".into(),
        })
        .unwrap();
        match response {
            Packet::InvalidField { field, .. } => assert_eq!(field, "path"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_current_identity() {
        match handle(Packet::ResolveUser { user: None }).unwrap() {
            Packet::ResolveResult { value } => assert!(!value.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
        match handle(Packet::ResolveGroup { group: None }).unwrap() {
            Packet::ResolveResult { value } => assert!(!value.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_query_group_members() {
        // Group 0 exists on every unix system.
        match handle(Packet::QueryGroup { group: "0".into() }).unwrap() {
            Packet::GroupEntry { gid, .. } => assert_eq!(gid, 0),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_response_packet_as_request_is_rejected() {
        match handle(Packet::Ack).unwrap() {
            Packet::InvalidField { field, .. } => assert_eq!(field, "packet"),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
