//! Client side of a push, built without the git binary
#![allow(dead_code)]

use std::path::Path;
use wflib_git::object::{serialize_tree, ObjectId, TreeEntry, MODE_BLOB, MODE_TREE};
use wflib_git::pack::generate_packfile;
use wflib_git::protocol::{PktLine, PktLineReader, PktLineWriter};
use wflib_git::{GitStorage, ReceiveCommand};

/// A local repository holding commits to push
pub struct Client {
    pub storage: GitStorage,
}

impl Client {
    pub fn new(dir: &Path) -> Self {
        Self {
            storage: GitStorage::init_bare(dir.join("client.git")).unwrap(),
        }
    }

    /// Commit `vars/<name>.groovy` and return the commit plus every object
    /// it introduced
    pub fn commit(&self, parent: Option<ObjectId>, name: &str, body: &str) -> (ObjectId, Vec<ObjectId>) {
        let blob = self.storage.write_blob(body.as_bytes()).unwrap();
        let vars = self
            .storage
            .write_tree(&serialize_tree(&[TreeEntry::new(MODE_BLOB, format!("{}.groovy", name), blob)]))
            .unwrap();
        let root = self
            .storage
            .write_tree(&serialize_tree(&[TreeEntry::new(MODE_TREE, "vars", vars)]))
            .unwrap();

        let mut content = format!("tree {}\n", root);
        if let Some(parent) = parent {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!(
            "author Dev <dev@example.com> 1700000000 +0000\ncommitter Dev <dev@example.com> 1700000000 +0000\n\nadd {}\n",
            name
        ));
        let commit = self.storage.write_commit(content.as_bytes()).unwrap();
        (commit, vec![commit, root, vars, blob])
    }

    /// A receive-pack request body asking for report-status
    pub fn push_body(&self, commands: &[ReceiveCommand], objects: &[ObjectId]) -> Vec<u8> {
        let mut writer = PktLineWriter::new();
        for (i, command) in commands.iter().enumerate() {
            if i == 0 {
                writer.write_str(&format!("{}\0report-status", command.to_line()));
            } else {
                writer.write_str(&command.to_line());
            }
        }
        writer.flush();
        let mut body = writer.into_bytes();
        if !objects.is_empty() {
            body.extend_from_slice(&generate_packfile(&self.storage, objects).unwrap());
        }
        body
    }
}

pub fn create(new: ObjectId, ref_name: &str) -> ReceiveCommand {
    ReceiveCommand::new(None, Some(new), ref_name)
}

pub fn update(old: ObjectId, new: ObjectId, ref_name: &str) -> ReceiveCommand {
    ReceiveCommand::new(Some(old), Some(new), ref_name)
}

/// Text lines of a report-status response
pub fn report_lines(response: &[u8]) -> Vec<String> {
    let mut reader = PktLineReader::new(response);
    let mut lines = Vec::new();
    while let Some(pkt) = reader.read().unwrap() {
        if let PktLine::Data(data) = pkt {
            lines.push(String::from_utf8_lossy(data).trim_end().to_string());
        }
    }
    lines
}
