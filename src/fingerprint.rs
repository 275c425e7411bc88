//! Content fingerprints of declared inputs and outputs.
//!
//! Everything is content-hashed with BLAKE3; timestamps are never consulted.
//! A fingerprint is an ordered map from spec key to the digest of that spec,
//! so the declaration order of specs never influences the result.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fs;
use std::hash::Hash;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::FingerprintError;
use crate::task::Spec;

/// One entry found below a declared directory tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeEntry {
    File(Hash32),
    Directory,
}

/// The fingerprint of a single spec.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecFingerprint {
    /// The declared path does not exist. Distinct from every present state,
    /// so deleting a file or a tree is always a change.
    Missing,
    File(Hash32),
    /// Relative path to entry. The key set is the structural signature: an
    /// empty tree is `Tree({})`, not `Missing`.
    Tree(BTreeMap<Utf8PathBuf, TreeEntry>),
    Property(Hash32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    entries: BTreeMap<String, SpecFingerprint>,
}

impl Fingerprint {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SpecFingerprint> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// A single digest standing for the whole fingerprint.
    pub fn digest(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::default();
        self.hash(&mut hasher);
        hasher.into()
    }

    /// Spec keys whose fingerprint differs between `self` and `other`,
    /// including keys present on one side only.
    pub fn changed(&self, other: &Fingerprint) -> Vec<String> {
        let mut changed: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, value)| other.entries.get(*key) != Some(value))
            .map(|(key, _)| key.clone())
            .collect();

        changed.extend(
            other
                .entries
                .keys()
                .filter(|key| !self.entries.contains_key(*key))
                .cloned(),
        );

        changed.sort();
        changed
    }
}

/// Computes fingerprints relative to a root directory.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    root: Utf8PathBuf,
}

impl Fingerprinter {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Fingerprints every spec; specs are hashed in parallel.
    ///
    /// Properties sharing a name are folded into one entry, in sorted order.
    pub fn fingerprint(&self, specs: &[Spec]) -> Result<Fingerprint, FingerprintError> {
        let mut sorted: Vec<&Spec> = specs.iter().collect();
        sorted.sort();
        sorted.dedup();

        let hashed = sorted
            .par_iter()
            .map(|spec| Ok((spec.key(), self.fingerprint_spec(spec)?)))
            .collect::<Result<Vec<_>, FingerprintError>>()?;

        let mut entries = BTreeMap::new();
        for (key, fingerprint) in hashed {
            match entries.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(fingerprint);
                }
                Entry::Occupied(mut slot) => {
                    let mut hasher = Blake3Hasher::default();
                    (slot.get(), &fingerprint).hash(&mut hasher);
                    slot.insert(SpecFingerprint::Property(hasher.into()));
                }
            }
        }

        Ok(Fingerprint { entries })
    }

    fn fingerprint_spec(&self, spec: &Spec) -> Result<SpecFingerprint, FingerprintError> {
        match spec {
            Spec::File(path) | Spec::Tree(path) => self.fingerprint_path(&self.root.join(path)),
            Spec::Property { value, .. } => Ok(SpecFingerprint::Property(Hash32::hash(value))),
        }
    }

    /// A file declared as a tree is hashed as a file and vice versa, so the
    /// kind of the path on disk is part of the fingerprint.
    fn fingerprint_path(&self, path: &Utf8Path) -> Result<SpecFingerprint, FingerprintError> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SpecFingerprint::Missing),
            Err(source) => {
                return Err(FingerprintError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };

        if meta.is_dir() {
            return Ok(SpecFingerprint::Tree(hash_tree(path)?));
        }

        match Hash32::hash_file(path) {
            Ok(hash) => Ok(SpecFingerprint::File(hash)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(SpecFingerprint::Missing),
            Err(source) => Err(FingerprintError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }
}

fn hash_tree(root: &Utf8Path) -> Result<BTreeMap<Utf8PathBuf, TreeEntry>, FingerprintError> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(root.as_str()));

    let mut paths = Vec::new();
    for entry in glob::glob(&pattern)? {
        paths.push(Utf8PathBuf::try_from(entry?)?);
    }

    paths
        .par_iter()
        .map(|path| {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| FingerprintError::OutsideTree {
                    root: root.to_owned(),
                    path: path.clone(),
                })?
                .to_owned();
            let entry = if path.is_dir() {
                TreeEntry::Directory
            } else {
                let hash = Hash32::hash_file(path).map_err(|source| FingerprintError::Io {
                    path: path.clone(),
                    source,
                })?;
                TreeEntry::File(hash)
            };
            Ok((relative, entry))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn workspace() -> (TempDir, Fingerprinter) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, Fingerprinter::new(root))
    }

    fn write(fp: &Fingerprinter, path: &str, contents: &str) {
        let path = fp.root().join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_deterministic() {
        let (_dir, fp) = workspace();
        write(&fp, "a.txt", "hello");
        write(&fp, "src/lib.rs", "fn main() {}");

        let specs = [Spec::file("a.txt"), Spec::tree("src")];
        assert_eq!(fp.fingerprint(&specs).unwrap(), fp.fingerprint(&specs).unwrap());
    }

    #[test]
    fn test_single_byte_change() {
        let (_dir, fp) = workspace();
        write(&fp, "a.txt", "hello");
        let before = fp.fingerprint(&[Spec::file("a.txt")]).unwrap();

        write(&fp, "a.txt", "hellp");
        let after = fp.fingerprint(&[Spec::file("a.txt")]).unwrap();

        assert_ne!(before, after);
        assert_eq!(before.changed(&after), vec!["file:a.txt".to_string()]);
    }

    #[test]
    fn test_missing_is_distinct() {
        let (_dir, fp) = workspace();
        let missing = fp.fingerprint(&[Spec::file("gone.txt")]).unwrap();
        assert_eq!(missing.get("file:gone.txt"), Some(&SpecFingerprint::Missing));

        write(&fp, "gone.txt", "");
        let empty = fp.fingerprint(&[Spec::file("gone.txt")]).unwrap();
        assert_ne!(missing, empty);
    }

    #[test]
    fn test_empty_tree_differs_from_absent_tree() {
        let (_dir, fp) = workspace();
        let absent = fp.fingerprint(&[Spec::tree("out")]).unwrap();

        fs::create_dir_all(fp.root().join("out")).unwrap();
        let empty = fp.fingerprint(&[Spec::tree("out")]).unwrap();

        assert_eq!(absent.get("tree:out"), Some(&SpecFingerprint::Missing));
        assert_eq!(empty.get("tree:out"), Some(&SpecFingerprint::Tree(BTreeMap::new())));
    }

    #[test]
    fn test_tree_add_remove_modify() {
        let (_dir, fp) = workspace();
        write(&fp, "src/a.rs", "a");
        write(&fp, "src/nested/b.rs", "b");
        let specs = [Spec::tree("src")];
        let base = fp.fingerprint(&specs).unwrap();

        let SpecFingerprint::Tree(entries) = base.get("tree:src").unwrap() else {
            panic!("expected a tree");
        };
        assert!(matches!(entries.get(Utf8Path::new("nested")), Some(TreeEntry::Directory)));
        assert!(matches!(entries.get(Utf8Path::new("nested/b.rs")), Some(TreeEntry::File(_))));

        write(&fp, "src/c.rs", "c");
        let added = fp.fingerprint(&specs).unwrap();
        assert_ne!(base, added);

        fs::remove_file(fp.root().join("src/c.rs")).unwrap();
        assert_eq!(base, fp.fingerprint(&specs).unwrap());

        write(&fp, "src/nested/b.rs", "B");
        assert_ne!(base, fp.fingerprint(&specs).unwrap());

        write(&fp, "src/nested/b.rs", "b");
        fs::create_dir_all(fp.root().join("src/empty")).unwrap();
        assert_ne!(base, fp.fingerprint(&specs).unwrap());
    }

    #[test]
    fn test_hidden_files_are_tracked() {
        let (_dir, fp) = workspace();
        write(&fp, "src/a.rs", "a");
        let before = fp.fingerprint(&[Spec::tree("src")]).unwrap();

        write(&fp, "src/.env", "SECRET=1");
        assert_ne!(before, fp.fingerprint(&[Spec::tree("src")]).unwrap());
    }

    #[test]
    fn test_property_value() {
        let (_dir, fp) = workspace();
        let a = fp.fingerprint(&[Spec::property("level", &3).unwrap()]).unwrap();
        let b = fp.fingerprint(&[Spec::property("level", &4).unwrap()]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_colliding_property_names() {
        let (_dir, fp) = workspace();
        let one = Spec::property("opt", &1).unwrap();
        let two = Spec::property("opt", &2).unwrap();

        let forward = fp.fingerprint(&[one.clone(), two.clone()]).unwrap();
        let reversed = fp.fingerprint(&[two.clone(), one.clone()]).unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(forward.keys().collect::<Vec<_>>(), vec!["property:opt"]);

        assert_ne!(forward, fp.fingerprint(&[one.clone()]).unwrap());
        assert_ne!(forward, fp.fingerprint(&[two.clone()]).unwrap());
        assert_eq!(
            fp.fingerprint(&[one.clone(), one.clone()]).unwrap(),
            fp.fingerprint(&[one]).unwrap()
        );
    }

    proptest! {
        #[test]
        fn declaration_order_is_irrelevant(
            values in proptest::collection::vec("[a-z]{0,8}", 1..8),
            seed in any::<u64>(),
        ) {
            let (_dir, fp) = workspace();
            let mut specs = Vec::new();
            for (i, value) in values.iter().enumerate() {
                write(&fp, &format!("f{i}.txt"), value);
                specs.push(Spec::file(format!("f{i}.txt")));
                specs.push(Spec::property(format!("p{i}"), value).unwrap());
                specs.push(Spec::property("shared", &(i, value)).unwrap());
            }

            let mut shuffled = specs.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.swap(0, len - 1);

            let a = fp.fingerprint(&specs).unwrap();
            let b = fp.fingerprint(&shuffled).unwrap();
            prop_assert_eq!(a.digest(), b.digest());
            prop_assert_eq!(a, b);
        }
    }
}
