use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use xz2::read::XzDecoder;

use bk_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Gzip,
    Xz,
    Zstd,
    None,
}

fn detect_compression(magic: &[u8]) -> Compression {
    match magic {
        [0x1f, 0x8b, ..] => Compression::Gzip,
        [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => Compression::Xz,
        [0x28, 0xb5, 0x2f, 0xfd, ..] => Compression::Zstd,
        _ => Compression::None,
    }
}

/// Unpack a tar archive (plain, gzip, xz or zstd) into `dest`.
///
/// Compression is detected from the leading bytes, not the file name, since
/// bottle blobs are stored under their checksum. Entries that would land
/// outside `dest` are skipped by `tar`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), Error> {
    let mut file = File::open(archive).map_err(|e| Error::fs(archive, e))?;

    let mut magic = [0u8; 6];
    let read = file.read(&mut magic).map_err(|e| Error::fs(archive, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::fs(archive, e))?;

    fs::create_dir_all(dest).map_err(|e| Error::fs(dest, e))?;

    let reader = BufReader::new(file);
    let result = match detect_compression(&magic[..read]) {
        Compression::Gzip => unpack(GzDecoder::new(reader), dest),
        Compression::Xz => unpack(XzDecoder::new(reader), dest),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::with_buffer(reader)
                .map_err(|e| Error::fs(archive, e))?;
            unpack(decoder, dest)
        }
        Compression::None => unpack(reader, dest),
    };

    result.map_err(|e| Error::fs(archive, format!("failed to extract archive: {e}")))
}

fn unpack<R: Read>(reader: R, dest: &Path) -> std::io::Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

/// The directory an archive "really" unpacked to.
///
/// Source tarballs conventionally wrap everything in one `name-version/`
/// directory; when that is the only entry, it is returned, otherwise `dir`.
pub fn single_top_level_dir(dir: &Path) -> Result<PathBuf, Error> {
    let entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::fs(dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(dir.to_path_buf()),
    }
}
