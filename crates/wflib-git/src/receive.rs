//! git-receive-pack sessions
//!
//! One [`ReceivePack`] serves one push: parse the ref update commands, unpack
//! the packfile, apply each command with a compare-and-swap on the ref, call
//! the post-receive hook, then report status back to the client.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hook::{PostReceiveHook, UpdateServerInfo};
use crate::object::ObjectId;
use crate::pack::parse_packfile;
use crate::protocol::{parse_capabilities, sideband, sideband_limit, PktLineReader, PktLineWriter};
use crate::refs::validate_pushable_ref;
use crate::storage::GitStorage;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    NotAttempted,
    Ok,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Update,
    Delete,
}

/// One `<old> <new> <ref>` line of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveCommand {
    pub old_oid: Option<ObjectId>,
    pub new_oid: Option<ObjectId>,
    pub ref_name: String,
    pub result: CommandResult,
}

impl ReceiveCommand {
    pub fn new(old_oid: Option<ObjectId>, new_oid: Option<ObjectId>, ref_name: impl Into<String>) -> Self {
        Self {
            old_oid,
            new_oid,
            ref_name: ref_name.into(),
            result: CommandResult::NotAttempted,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match (self.old_oid, self.new_oid) {
            (None, _) => CommandKind::Create,
            (Some(_), None) => CommandKind::Delete,
            (Some(_), Some(_)) => CommandKind::Update,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == CommandResult::Ok
    }

    /// Parse `<old-hex> <new-hex> <ref>[\0<caps>]`
    fn parse(line: &str) -> Result<(Self, Option<&str>)> {
        let (line, caps) = match line.split_once('\0') {
            Some((line, caps)) => (line, Some(caps)),
            None => (line, None),
        };
        let malformed = || Error::ProtocolError(format!("malformed command: {:?}", line));

        let mut parts = line.splitn(3, ' ');
        let old = parts.next().and_then(ObjectId::from_hex_nonzero).ok_or_else(malformed)?;
        let new = parts.next().and_then(ObjectId::from_hex_nonzero).ok_or_else(malformed)?;
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(malformed)?;

        Ok((Self::new(old, new, name), caps))
    }

    /// The wire form, as a client sends it
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            self.old_oid.unwrap_or(ObjectId::ZERO),
            self.new_oid.unwrap_or(ObjectId::ZERO),
            self.ref_name
        )
    }
}

impl fmt::Display for ReceiveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

struct ReceiveRequest<'a> {
    commands: Vec<ReceiveCommand>,
    capabilities: Vec<String>,
    pack: &'a [u8],
}

impl<'a> ReceiveRequest<'a> {
    fn parse(body: &'a [u8]) -> Result<Self> {
        let mut reader = PktLineReader::new(body);
        let mut commands = Vec::new();
        let mut capabilities = Vec::new();

        for line in reader.read_text_until_flush()? {
            if line.starts_with("shallow ") {
                continue;
            }
            let (command, caps) = ReceiveCommand::parse(line)?;
            if let Some(caps) = caps {
                capabilities = parse_capabilities(caps);
            }
            commands.push(command);
        }

        Ok(Self {
            commands,
            capabilities,
            pack: reader.remaining(),
        })
    }

    fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

/// A push session against one repository
pub struct ReceivePack {
    storage: Arc<GitStorage>,
    post_receive: Arc<dyn PostReceiveHook>,
}

impl ReceivePack {
    /// New session with the default post-receive hook ([`UpdateServerInfo`])
    pub fn new(storage: Arc<GitStorage>) -> Self {
        Self {
            storage,
            post_receive: Arc::new(UpdateServerInfo),
        }
    }

    pub fn storage(&self) -> &GitStorage {
        &self.storage
    }

    pub fn post_receive_hook(&self) -> Arc<dyn PostReceiveHook> {
        self.post_receive.clone()
    }

    pub fn set_post_receive_hook(&mut self, hook: Arc<dyn PostReceiveHook>) {
        self.post_receive = hook;
    }

    /// Handle a POST /git-receive-pack body and produce the response body.
    ///
    /// The post-receive hook runs before this returns, so the client only sees
    /// the report once every hook has finished.
    pub fn receive(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut request = ReceiveRequest::parse(body)?;
        let mut commands = std::mem::take(&mut request.commands);
        debug!(commands = commands.len(), pack_bytes = request.pack.len(), "receive-pack request");

        let unpack = if request.pack.is_empty() {
            Ok(())
        } else {
            parse_packfile(&self.storage, request.pack).map(|_| ())
        };

        match &unpack {
            Ok(()) => {
                for command in commands.iter_mut() {
                    command.result = self.execute(command);
                }
            }
            Err(e) => {
                warn!(error = %e, "unpack failed; rejecting all commands");
                for command in commands.iter_mut() {
                    command.result = CommandResult::Rejected("unpacker error".into());
                }
            }
        }

        // Hooks see only applied commands, possibly none; filtering an empty
        // list is left to the hook.
        if unpack.is_ok() && !commands.is_empty() {
            let applied: Vec<ReceiveCommand> = commands.iter().filter(|c| c.is_ok()).cloned().collect();
            self.post_receive.on_post_receive(self, &applied);
        }

        if !request.has_capability("report-status") {
            return Ok(Vec::new());
        }
        Ok(report(&unpack, &commands, sideband_limit(&request.capabilities)))
    }

    fn execute(&self, command: &ReceiveCommand) -> CommandResult {
        if validate_pushable_ref(&command.ref_name).is_err() {
            return CommandResult::Rejected("funny refname".into());
        }
        if command.old_oid.is_none() && command.new_oid.is_none() {
            return CommandResult::Rejected("invalid command".into());
        }
        if let Some(new) = &command.new_oid {
            match self.storage.has_object(new) {
                Ok(true) => {}
                Ok(false) => return CommandResult::Rejected("missing necessary objects".into()),
                Err(e) => return CommandResult::Rejected(e.to_string()),
            }
        }

        let swapped = self.storage.compare_and_swap_ref(
            &command.ref_name,
            command.old_oid.as_ref(),
            command.new_oid.as_ref(),
        );
        match swapped {
            Ok(true) => {
                info!(ref_name = %command.ref_name, kind = ?command.kind(), "ref updated");
                CommandResult::Ok
            }
            Ok(false) => {
                let reason = match command.kind() {
                    CommandKind::Create => "already exists",
                    CommandKind::Update | CommandKind::Delete => "fetch first",
                };
                warn!(ref_name = %command.ref_name, reason, "ref update rejected");
                CommandResult::Rejected(reason.into())
            }
            Err(Error::RefLocked(_)) => CommandResult::Rejected("failed to lock".into()),
            Err(e) => CommandResult::Rejected(e.to_string()),
        }
    }
}

fn report(unpack: &Result<()>, commands: &[ReceiveCommand], sideband_max: Option<usize>) -> Vec<u8> {
    let mut status = PktLineWriter::new();
    match unpack {
        Ok(()) => status.write_str("unpack ok"),
        Err(e) => status.write_str(&format!("unpack {}", e.to_string().replace('\n', " "))),
    }
    for command in commands {
        match &command.result {
            CommandResult::Ok => status.write_str(&format!("ok {}", command.ref_name)),
            CommandResult::Rejected(reason) => {
                status.write_str(&format!("ng {} {}", command.ref_name, reason))
            }
            CommandResult::NotAttempted => {
                status.write_str(&format!("ng {} not attempted", command.ref_name))
            }
        }
    }
    status.flush();

    let Some(max_data) = sideband_max else {
        return status.into_bytes();
    };
    let mut response = PktLineWriter::new();
    response.write_sideband(sideband::DATA, status.as_bytes(), max_data);
    response.flush();
    response.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::generate_packfile;
    use crate::refs::Ref;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn request(commands: &[ReceiveCommand], caps: &str, pack: &[u8]) -> Vec<u8> {
        let mut writer = PktLineWriter::new();
        for (i, command) in commands.iter().enumerate() {
            if i == 0 {
                writer.write_str(&format!("{}\0{}", command.to_line(), caps));
            } else {
                writer.write_str(&command.to_line());
            }
        }
        writer.flush();
        let mut body = writer.into_bytes();
        body.extend_from_slice(pack);
        body
    }

    fn setup() -> (tempfile::TempDir, Arc<GitStorage>, ObjectId, Vec<u8>) {
        let dir = tempdir().unwrap();
        let client = GitStorage::init_bare(dir.path().join("client.git")).unwrap();
        let tree = client.write_tree(b"").unwrap();
        let commit = client
            .write_commit(
                format!("tree {}\nauthor T <t@t> 1 +0000\ncommitter T <t@t> 1 +0000\n\nvars\n", tree)
                    .as_bytes(),
            )
            .unwrap();
        let pack = generate_packfile(&client, &[commit, tree]).unwrap();
        let server = Arc::new(GitStorage::init_bare(dir.path().join("server.git")).unwrap());
        (dir, server, commit, pack)
    }

    #[test]
    fn test_push_creates_branch() {
        let (_dir, server, commit, pack) = setup();
        let rp = ReceivePack::new(server.clone());

        let body = request(
            &[ReceiveCommand::new(None, Some(commit), "refs/heads/master")],
            "report-status",
            &pack,
        );
        let response = String::from_utf8(rp.receive(&body).unwrap()).unwrap();

        assert!(response.contains("unpack ok"), "{}", response);
        assert!(response.contains("ok refs/heads/master"), "{}", response);
        assert_eq!(server.resolve_ref("HEAD").unwrap(), commit);
        // default hook refreshed the dumb-http listing
        let info = std::fs::read_to_string(server.path().join("info/refs")).unwrap();
        assert!(info.contains("refs/heads/master"));
    }

    #[test]
    fn test_hook_sees_only_applied_commands_after_refs_written() {
        let (_dir, server, commit, pack) = setup();
        server.write_ref("refs/heads/taken", &Ref::Direct(commit)).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observed = seen.clone();
        let mut rp = ReceivePack::new(server.clone());
        rp.set_post_receive_hook(Arc::new(move |rp: &ReceivePack, cmds: &[ReceiveCommand]| {
            for cmd in cmds {
                let on_disk = rp.storage().resolve_ref(&cmd.ref_name).ok();
                observed.lock().unwrap().push((cmd.ref_name.clone(), on_disk));
            }
        }));

        let body = request(
            &[
                ReceiveCommand::new(None, Some(commit), "refs/heads/x"),
                ReceiveCommand::new(None, Some(commit), "refs/heads/taken"),
            ],
            "report-status",
            &pack,
        );
        let response = String::from_utf8(rp.receive(&body).unwrap()).unwrap();

        assert!(response.contains("ng refs/heads/taken already exists"), "{}", response);
        assert_eq!(*seen.lock().unwrap(), vec![("refs/heads/x".to_string(), Some(commit))]);
    }

    #[test]
    fn test_bad_pack_mutates_nothing() {
        let (_dir, server, commit, mut pack) = setup();
        let last = pack.len() - 1;
        pack[last] ^= 0xff;

        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut rp = ReceivePack::new(server.clone());
        rp.set_post_receive_hook(Arc::new(move |_: &ReceivePack, _: &[ReceiveCommand]| {
            *counter.lock().unwrap() += 1;
        }));

        let body = request(
            &[ReceiveCommand::new(None, Some(commit), "refs/heads/master")],
            "report-status",
            &pack,
        );
        let response = String::from_utf8(rp.receive(&body).unwrap()).unwrap();

        assert!(response.contains("ng refs/heads/master unpacker error"), "{}", response);
        assert!(server.list_refs().unwrap().is_empty());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_stale_update_and_delete() {
        let (_dir, server, commit, pack) = setup();
        let rp = ReceivePack::new(server.clone());
        let other = server.write_blob(b"not the tip").unwrap();

        let body = request(
            &[ReceiveCommand::new(None, Some(commit), "refs/heads/master")],
            "report-status",
            &pack,
        );
        rp.receive(&body).unwrap();

        let stale = request(
            &[ReceiveCommand::new(Some(other), Some(commit), "refs/heads/master")],
            "report-status",
            &[],
        );
        let response = String::from_utf8(rp.receive(&stale).unwrap()).unwrap();
        assert!(response.contains("ng refs/heads/master fetch first"), "{}", response);

        let delete = request(
            &[ReceiveCommand::new(Some(commit), None, "refs/heads/master")],
            "report-status delete-refs",
            &[],
        );
        let response = String::from_utf8(rp.receive(&delete).unwrap()).unwrap();
        assert!(response.contains("ok refs/heads/master"), "{}", response);
        assert!(server.list_refs().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_refs_outside_namespace_and_missing_objects() {
        let (_dir, server, commit, _pack) = setup();
        let rp = ReceivePack::new(server.clone());

        let body = request(
            &[
                ReceiveCommand::new(None, Some(commit), "config"),
                ReceiveCommand::new(None, Some(commit), "refs/heads/master"),
            ],
            "report-status",
            &[],
        );
        let response = String::from_utf8(rp.receive(&body).unwrap()).unwrap();

        assert!(response.contains("ng config funny refname"), "{}", response);
        assert!(response.contains("ng refs/heads/master missing necessary objects"), "{}", response);
    }

    #[test]
    fn test_sideband_report() {
        let (_dir, server, commit, pack) = setup();
        let rp = ReceivePack::new(server);

        let body = request(
            &[ReceiveCommand::new(None, Some(commit), "refs/heads/master")],
            "report-status side-band-64k",
            &pack,
        );
        let response = rp.receive(&body).unwrap();

        let mut reader = PktLineReader::new(&response);
        let Some(crate::protocol::PktLine::Data(band)) = reader.read().unwrap() else {
            panic!("expected side-band packet")
        };
        assert_eq!(band[0], sideband::DATA);
        assert!(String::from_utf8_lossy(&band[1..]).contains("ok refs/heads/master"));
    }

    #[test]
    fn test_no_report_without_capability() {
        let (_dir, server, commit, pack) = setup();
        let rp = ReceivePack::new(server.clone());
        let body = request(&[ReceiveCommand::new(None, Some(commit), "refs/heads/master")], "", &pack);

        assert!(rp.receive(&body).unwrap().is_empty());
        assert_eq!(server.resolve_ref("refs/heads/master").unwrap(), commit);
    }

    #[test]
    fn test_malformed_command_is_protocol_error() {
        let (_dir, server, _commit, _pack) = setup();
        let rp = ReceivePack::new(server);
        let mut writer = PktLineWriter::new();
        writer.write_str("not a command");
        writer.flush();

        assert!(matches!(rp.receive(&writer.into_bytes()), Err(Error::ProtocolError(_))));
    }
}
