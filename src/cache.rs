//! Build cache client interface and a cache kept in a local directory.
//!
//! Entries are addressed by [`cache_key`]: the task identity plus its input
//! fingerprint. A hit lets the engine restore outputs instead of running the
//! task's action.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32, TaskId};
use crate::fingerprint::Fingerprint;
use crate::task::{Spec, TaskNode};

/// A collaborator storing task outputs across invocations and machines.
///
/// Errors are never fatal: the engine logs them and runs the task.
pub trait BuildCache: Send + Sync {
    fn try_load(&self, node: &TaskNode, inputs: &Fingerprint) -> anyhow::Result<Option<OutputBundle>>;

    fn store(&self, node: &TaskNode, inputs: &Fingerprint, bundle: &OutputBundle) -> anyhow::Result<()>;
}

/// Address of a cache entry.
pub fn cache_key(id: &TaskId, inputs: &Fingerprint) -> Hash32 {
    use std::hash::Hash;

    let mut hasher = Blake3Hasher::default();
    id.as_str().hash(&mut hasher);
    inputs.digest().hash(&mut hasher);
    hasher.into()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum TreeItem {
    File(Vec<u8>),
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Captured {
    Missing,
    File(Vec<u8>),
    Tree(BTreeMap<Utf8PathBuf, TreeItem>),
}

/// The declared outputs of a task as they were after it ran.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBundle {
    entries: Vec<(Spec, Captured)>,
}

impl OutputBundle {
    /// Reads every declared file and tree output below `root`. Absent
    /// outputs are captured as absent, property outputs are ignored.
    pub fn capture(root: &Utf8Path, outputs: &[Spec]) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(outputs.len());

        for spec in outputs {
            let Some(path) = spec.path() else {
                continue;
            };
            let path = root.join(path);

            let captured = match fs::metadata(&path) {
                Err(e) if e.kind() == ErrorKind::NotFound => Captured::Missing,
                Err(e) => return Err(e).with_context(|| format!("Couldn't stat {path}")),
                Ok(meta) if meta.is_dir() => Captured::Tree(capture_tree(&path)?),
                Ok(_) => Captured::File(
                    fs::read(&path).with_context(|| format!("Couldn't read {path}"))?,
                ),
            };

            entries.push((spec.clone(), captured));
        }

        Ok(Self { entries })
    }

    /// Writes the captured outputs back below `root`, replacing whatever is
    /// there now.
    pub fn restore(&self, root: &Utf8Path) -> anyhow::Result<()> {
        for (spec, captured) in &self.entries {
            let Some(path) = spec.path() else {
                continue;
            };
            let path = root.join(path);

            remove_path(&path)?;

            match captured {
                Captured::Missing => {}
                Captured::File(bytes) => write_file(&path, bytes)?,
                Captured::Tree(items) => {
                    fs::create_dir_all(&path)
                        .with_context(|| format!("Couldn't create {path}"))?;
                    for (relative, item) in items {
                        let target = path.join(relative);
                        match item {
                            TreeItem::Directory => fs::create_dir_all(&target)
                                .with_context(|| format!("Couldn't create {target}"))?,
                            TreeItem::File(bytes) => write_file(&target, bytes)?,
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn capture_tree(root: &Utf8Path) -> anyhow::Result<BTreeMap<Utf8PathBuf, TreeItem>> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(root.as_str()));
    let mut items = BTreeMap::new();

    for entry in glob::glob(&pattern)? {
        let path = Utf8PathBuf::try_from(entry?)?;
        let relative = path.strip_prefix(root)?.to_owned();
        let item = if path.is_dir() {
            TreeItem::Directory
        } else {
            TreeItem::File(fs::read(&path).with_context(|| format!("Couldn't read {path}"))?)
        };
        items.insert(relative, item);
    }

    Ok(items)
}

fn remove_path(path: &Utf8Path) -> anyhow::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
    };
    result.with_context(|| format!("Couldn't remove {path}"))
}

fn write_file(path: &Utf8Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;
    }
    fs::write(path, bytes).with_context(|| format!("Couldn't write {path}"))
}

/// Keeps one CBOR file per entry in a directory.
#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: Utf8PathBuf,
}

impl LocalCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn entry_path(&self, key: Hash32) -> Utf8PathBuf {
        self.dir.join(format!("{}.cbor", key.to_hex()))
    }
}

impl BuildCache for LocalCache {
    fn try_load(&self, node: &TaskNode, inputs: &Fingerprint) -> anyhow::Result<Option<OutputBundle>> {
        let path = self.entry_path(cache_key(node.id(), inputs));

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Couldn't open {path}")),
        };

        let bundle = ciborium::from_reader(BufReader::new(file))
            .with_context(|| format!("Couldn't decode cache entry {path}"))?;

        Ok(Some(bundle))
    }

    fn store(&self, node: &TaskNode, inputs: &Fingerprint, bundle: &OutputBundle) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("Couldn't create {}", self.dir))?;

        let path = self.entry_path(cache_key(node.id(), inputs));
        let temp = path.with_extension("tmp");

        let mut writer = BufWriter::new(File::create(&temp)?);
        ciborium::into_writer(bundle, &mut writer)?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp, &path).with_context(|| format!("Couldn't write {path}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprinter;

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8Path::from_path(dir.path()).unwrap().to_owned()
    }

    #[test]
    fn test_capture_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let root = root(&dir);
        fs::create_dir_all(root.join("out/sub")).unwrap();
        fs::create_dir_all(root.join("out/empty")).unwrap();
        fs::write(root.join("out/sub/a.txt"), "a").unwrap();
        fs::write(root.join("report.txt"), "ok").unwrap();

        let outputs = [Spec::tree("out"), Spec::file("report.txt"), Spec::file("never.txt")];
        let fp = Fingerprinter::new(root.clone());
        let before = fp.fingerprint(&outputs).unwrap();
        let bundle = OutputBundle::capture(&root, &outputs).unwrap();

        fs::remove_dir_all(root.join("out")).unwrap();
        fs::write(root.join("report.txt"), "tampered").unwrap();
        fs::write(root.join("never.txt"), "stray").unwrap();

        bundle.restore(&root).unwrap();
        assert_eq!(fp.fingerprint(&outputs).unwrap(), before);
    }

    #[test]
    fn test_local_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = root(&dir);
        fs::write(root.join("out.bin"), [0u8, 1, 2, 3]).unwrap();

        let node = TaskNode::new(":pack").output(Spec::file("out.bin")).lifecycle();
        let fp = Fingerprinter::new(root.clone());
        let inputs = fp.fingerprint(&[Spec::property("level", &9).unwrap()]).unwrap();

        let cache = LocalCache::new(root.join("cache"));
        assert!(cache.try_load(&node, &inputs).unwrap().is_none());

        let bundle = OutputBundle::capture(&root, node.outputs()).unwrap();
        cache.store(&node, &inputs, &bundle).unwrap();
        assert_eq!(cache.try_load(&node, &inputs).unwrap(), Some(bundle));

        let other = fp.fingerprint(&[Spec::property("level", &1).unwrap()]).unwrap();
        assert!(cache.try_load(&node, &other).unwrap().is_none());
    }

    #[test]
    fn test_key_depends_on_identity() {
        let inputs = Fingerprint::default();
        assert_ne!(
            cache_key(&TaskId::new(":a"), &inputs),
            cache_key(&TaskId::new(":b"), &inputs)
        );
    }
}
