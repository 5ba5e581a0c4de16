use log::{debug, warn};
use rand::Rng;
use relay_core::attachment::{AttachmentStorage, DownloadSink};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const PARTIAL_DIR: &str = ".partial";

/// Stores downloaded attachments under a root directory.
///
/// Downloads are written to `<root>/.partial/` and moved to
/// `<root>/<random dir>/<file name>` once complete, so two attachments with
/// the same name never collide.
#[derive(Debug, Clone)]
pub struct FsAttachmentStorage {
    root: PathBuf,
}

impl FsAttachmentStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(PARTIAL_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn random_name(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill(buf.as_mut_slice());
    hex::encode(buf)
}

// Only the final component of a server-supplied name is used.
fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

impl AttachmentStorage for FsAttachmentStorage {
    fn create_sink(&self, file_name: &str) -> io::Result<Box<dyn DownloadSink>> {
        let partial_path = self.root.join(PARTIAL_DIR).join(random_name(16));
        let file = File::create(&partial_path)?;
        debug!(target: "Relay/Download", "Writing {file_name} to {}", partial_path.display());
        Ok(Box::new(FsDownloadSink {
            writer: Some(BufWriter::new(file)),
            partial_path,
            root: self.root.clone(),
            file_name: sanitize_file_name(file_name),
        }))
    }
}

struct FsDownloadSink {
    writer: Option<BufWriter<File>>,
    partial_path: PathBuf,
    root: PathBuf,
    file_name: String,
}

impl Write for FsDownloadSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::other("download sink already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl DownloadSink for FsDownloadSink {
    fn finish(mut self: Box<Self>) -> io::Result<PathBuf> {
        let Some(writer) = self.writer.take() else {
            return Err(io::Error::other("download sink already closed"));
        };
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let dir = self.root.join(random_name(8));
        fs::create_dir_all(&dir)?;
        let target = dir.join(&self.file_name);
        fs::rename(&self.partial_path, &target)?;
        Ok(target)
    }

    fn discard(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = fs::remove_file(&self.partial_path) {
                warn!(
                    target: "Relay/Download",
                    "Failed to remove partial download {}: {e}",
                    self.partial_path.display()
                );
            }
        }
    }
}

impl Drop for FsDownloadSink {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial_files(storage: &FsAttachmentStorage) -> usize {
        fs::read_dir(storage.root().join(PARTIAL_DIR))
            .unwrap()
            .count()
    }

    #[test]
    fn test_finish_moves_file_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsAttachmentStorage::new(dir.path()).unwrap();

        let mut sink = storage.create_sink("photo.jpg").unwrap();
        sink.write_all(b"jpeg bytes").unwrap();
        let path = sink.finish().unwrap();

        assert_eq!(path.file_name().unwrap(), "photo.jpg");
        assert_eq!(fs::read(&path).unwrap(), b"jpeg bytes");
        assert_eq!(partial_files(&storage), 0);
    }

    #[test]
    fn test_same_name_does_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsAttachmentStorage::new(dir.path()).unwrap();

        let mut first = storage.create_sink("a.txt").unwrap();
        first.write_all(b"one").unwrap();
        let first = first.finish().unwrap();
        let mut second = storage.create_sink("a.txt").unwrap();
        second.write_all(b"two").unwrap();
        let second = second.finish().unwrap();

        assert_ne!(first, second);
        assert_eq!(fs::read(first).unwrap(), b"one");
        assert_eq!(fs::read(second).unwrap(), b"two");
    }

    #[test]
    fn test_discard_and_drop_remove_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsAttachmentStorage::new(dir.path()).unwrap();

        let mut sink = storage.create_sink("a.bin").unwrap();
        sink.write_all(b"partial").unwrap();
        sink.discard();
        assert_eq!(partial_files(&storage), 0);

        {
            let mut sink = storage.create_sink("b.bin").unwrap();
            sink.write_all(b"partial").unwrap();
            assert_eq!(partial_files(&storage), 1);
        }
        assert_eq!(partial_files(&storage), 0);
    }

    #[test]
    fn test_path_components_are_stripped() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(""), "attachment");
        assert_eq!(sanitize_file_name(".."), "attachment");
    }
}
