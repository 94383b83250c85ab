use std::{
    fs::{self, File},
    io::{self, BufWriter, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};

use crate::utils::path::basename;

/// One named blob travelling between the tool and a backup store.
pub struct Record {
    pub pathname: String,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record").field("pathname", &self.pathname).finish()
    }
}

impl Record {
    pub fn new(pathname: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        Self {
            pathname: pathname.into(),
            reader: Box::new(reader),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        basename(&self.pathname)
    }
}

/// Destination for backup records. `put` returns once the record is
/// durable and reports how many bytes were stored.
pub trait RecordSink {
    fn put(&mut self, pathname: &str, reader: &mut dyn Read) -> Result<u64>;
}

/// Flat directory of records, one file per record.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("create store {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self, pathname: &str) -> Result<PathBuf> {
        let name = basename(pathname);
        if name.is_empty() || name == "." || name == ".." {
            bail!("invalid record name: {pathname:?}");
        }
        Ok(self.root.join(name))
    }

    /// Regular files in name order, each opened when the iterator reaches
    /// it.
    pub fn records(&self) -> Result<impl Iterator<Item = Result<Record>> + use<>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("read store {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tmp-") {
                continue;
            }
            names.push(name);
        }
        names.sort();

        let root = self.root.clone();
        Ok(names.into_iter().map(move |name| {
            let path = root.join(&name);
            let f = File::open(&path).with_context(|| format!("open {}", path.display()))?;
            Ok(Record::new(format!("/{name}"), f))
        }))
    }
}

impl RecordSink for DirStore {
    fn put(&mut self, pathname: &str, reader: &mut dyn Read) -> Result<u64> {
        let target = self.target(pathname)?;
        let tmp = self.root.join(format!(".tmp-{}", basename(pathname)));

        let written = (|| -> Result<u64> {
            let mut out = BufWriter::new(
                File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?,
            );
            let n = io::copy(reader, &mut out).with_context(|| format!("store {pathname}"))?;
            let f = out
                .into_inner()
                .map_err(|e| e.into_error())
                .with_context(|| format!("flush {}", tmp.display()))?;
            f.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
            Ok(n)
        })();

        match written {
            Ok(n) => {
                fs::rename(&tmp, &target).with_context(|| {
                    format!("rename {} -> {}", tmp.display(), target.display())
                })?;
                tracing::debug!("stored {} ({n} bytes)", target.display());
                Ok(n)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }
}
