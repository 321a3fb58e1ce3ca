//! Names for the 32-bit parts of namespaced ids.
//!
//! The engine assigns every namespace, binding and metric name a small id
//! and builds binding and metric ids from them with
//! [`namespaced_id`](crate::namespaced_id). The table is persisted as a
//! plain text file, one name per line, where line `n` (counting from 1)
//! names id `n`. The engine appends; exporters in other processes read the
//! same file and [`reload`](Labels::reload) to pick up later names.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// File name of the label table inside its directory.
pub const LABELS_FILE_NAME: &str = "labels";

#[derive(Debug)]
pub struct Labels {
    path: PathBuf,
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Labels {
    /// Load the table stored in `directory`. A missing file is an empty
    /// table; it is created on the first [`supply_label_id`](Self::supply_label_id).
    pub fn open(directory: &Path) -> io::Result<Self> {
        let mut labels = Self {
            path: directory.join(LABELS_FILE_NAME),
            names: Vec::new(),
            ids: HashMap::new(),
        };
        labels.reload()?;
        Ok(labels)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of names in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Re-read the file, keeping ids already known.
    pub fn reload(&mut self) -> io::Result<()> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        // A line without its break is still being appended.
        let complete = contents
            .split_inclusive('\n')
            .filter_map(|line| line.strip_suffix('\n'));
        for name in complete.skip(self.names.len()) {
            self.push(name.to_owned());
        }
        trace!(path = %self.path.display(), labels = self.names.len(), "loaded labels");
        Ok(())
    }

    /// Id of `name`, appending it to the table on first use.
    ///
    /// Names must be non-empty and must not contain a line break.
    pub fn supply_label_id(&mut self, name: &str) -> io::Result<u32> {
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }
        if name.is_empty() || name.contains(['\n', '\r']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid label {name:?}"),
            ));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{name}")?;

        let id = self.push(name.to_owned());
        trace!(name, id, "supplied label");
        Ok(id)
    }

    /// Name of `id`, if the table has one.
    pub fn lookup_label(&self, id: u32) -> Option<&str> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }

    /// Id of `name` without adding it.
    pub fn lookup_label_id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    fn push(&mut self, name: String) -> u32 {
        self.names.push(name.clone());
        let id = self.names.len() as u32;
        self.ids.entry(name).or_insert(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut labels = Labels::open(dir.path()).unwrap();
        assert!(labels.is_empty());

        assert_eq!(labels.supply_label_id("ns1").unwrap(), 1);
        assert_eq!(labels.supply_label_id("binding1").unwrap(), 2);
        assert_eq!(labels.supply_label_id("ns1").unwrap(), 1);

        assert_eq!(labels.lookup_label(1), Some("ns1"));
        assert_eq!(labels.lookup_label(2), Some("binding1"));
        assert_eq!(labels.lookup_label(0), None);
        assert_eq!(labels.lookup_label(3), None);
        assert_eq!(labels.lookup_label_id("binding1"), Some(2));
        assert_eq!(labels.lookup_label_id("missing"), None);
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn second_handle_reloads_appended_names() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = dir.path().join("metrics");
        let mut writer = Labels::open(&metrics).unwrap();
        writer.supply_label_id("counter1").unwrap();

        let mut reader = Labels::open(&metrics).unwrap();
        assert_eq!(reader.lookup_label(1), Some("counter1"));

        writer.supply_label_id("gauge1").unwrap();
        assert_eq!(reader.lookup_label_id("gauge1"), None);
        reader.reload().unwrap();
        assert_eq!(reader.lookup_label_id("gauge1"), Some(2));
        assert_eq!(
            std::fs::read_to_string(writer.path()).unwrap(),
            "counter1\ngauge1\n"
        );

        let mut file = OpenOptions::new().append(true).open(writer.path()).unwrap();
        write!(file, "partial").unwrap();
        reader.reload().unwrap();
        assert_eq!(reader.len(), 2);
    }

    #[test]
    fn line_breaks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut labels = Labels::open(dir.path()).unwrap();
        let err = labels.supply_label_id("a\nb").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(labels.supply_label_id("").is_err());
        assert!(labels.is_empty());
        assert!(!labels.path().exists());
    }
}
