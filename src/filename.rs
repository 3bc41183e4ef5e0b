//! Filename classification and epoch remapping.
//!
//! The virtual environment routes every file operation by the shape of the
//! file's name: numeric data files (`00010.sst`) go to object storage,
//! numeric log files (`00011.log`) go to the log stream, and everything
//! else (manifests, identity files, CURRENT, LOCK, directories) stays on
//! the local filesystem.
//!
//! Remote object names additionally carry the epoch of the writer that
//! produced them: `00010.sst` becomes `{epoch}.00010.sst` and
//! `MANIFEST-000007` becomes `MANIFEST-{epoch}-000007`. Epochs never
//! contain `.`, and engine sequence numbers never contain `-`, which is
//! what makes both mappings reversible.

/// The three dispatch classes of the virtual environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Immutable data file (SST), persisted in object storage.
    Data,
    /// Write-ahead-log segment, persisted via the log stream.
    Log,
    /// Everything else: local filesystem.
    Other,
}

/// The final path component, with any directory part removed.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Classify a path into its dispatch class.
pub fn classify(path: &str) -> FileClass {
    let name = basename(path);
    if has_numeric_stem(name, "sst") {
        FileClass::Data
    } else if has_numeric_stem(name, "log") {
        FileClass::Log
    } else {
        FileClass::Other
    }
}

pub fn is_data_file(path: &str) -> bool {
    classify(path) == FileClass::Data
}

pub fn is_log_file(path: &str) -> bool {
    classify(path) == FileClass::Log
}

/// True for `<digits>.<ext>` and `<epoch>.<digits>.<ext>`.
fn has_numeric_stem(name: &str, ext: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    match parts.as_slice() {
        [stem, e] if *e == ext => is_digits(stem),
        [_epoch, stem, e] if *e == ext => is_digits(stem),
        _ => false,
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Remove a leading epoch component, returning the engine-visible name.
///
/// Names without an epoch component are returned unchanged.
pub fn strip_epoch(name: &str) -> String {
    let name = basename(name);
    let parts: Vec<&str> = name.split('.').collect();
    if let [_epoch, stem, ext] = parts.as_slice() {
        if is_digits(stem) && (*ext == "sst" || *ext == "log") {
            return format!("{stem}.{ext}");
        }
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        if let Some((_epoch, seq)) = rest.rsplit_once('-') {
            if is_digits(seq) {
                return format!("MANIFEST-{seq}");
            }
        }
    }
    name.to_string()
}

/// Attach an epoch to an engine-visible name, producing the remote name.
pub fn with_epoch(name: &str, epoch: &str) -> String {
    let name = basename(name);
    match classify(name) {
        FileClass::Data | FileClass::Log => format!("{epoch}.{name}"),
        FileClass::Other => match name.strip_prefix("MANIFEST-") {
            Some(seq) if is_digits(seq) => format!("MANIFEST-{epoch}-{seq}"),
            _ => name.to_string(),
        },
    }
}

/// The epoch component of a remote name, if it carries one.
pub fn epoch_of(name: &str) -> Option<&str> {
    let name = basename(name);
    let parts: Vec<&str> = name.split('.').collect();
    if let [epoch, stem, ext] = parts.as_slice() {
        if is_digits(stem) && (*ext == "sst" || *ext == "log") {
            return Some(epoch);
        }
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        if let Some((epoch, seq)) = rest.rsplit_once('-') {
            if is_digits(seq) && !epoch.is_empty() {
                return Some(epoch);
            }
        }
    }
    None
}

/// The engine sequence number embedded in a data or log file name,
/// epoch-qualified or not.
pub fn file_number(name: &str) -> Option<u64> {
    let stripped = strip_epoch(name);
    let (stem, _ext) = stripped.rsplit_once('.')?;
    if is_digits(stem) {
        stem.parse().ok()
    } else {
        None
    }
}
