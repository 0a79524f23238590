//! Chunked file cipher.
//!
//! Files are sealed as a plain concatenation of records:
//!
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Each record covers one [`CHUNK_SIZE`] block of plaintext under AES-128-GCM with
//! the database's [`DataKey`]. The last record is always short: a plaintext whose
//! length is a multiple of [`CHUNK_SIZE`], the empty one included, ends with a
//! record holding no ciphertext at all. There is no header, so the length of the
//! final record is inferred from EOF, and a stream that ends on a full record has
//! been cut off. Memory use is bounded by one record regardless of file size.
//!
//! All functions here do blocking file I/O. Async callers run them on
//! `tokio::task::spawn_blocking`.

mod errors;

pub use errors::CipherError;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use aes_gcm::{
    Aes128Gcm, Key, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

use crate::Result;
use crate::constants::PARTIAL_SUFFIX;
use crate::keys::DataKey;
use crate::paths::sidecar;

/// Plaintext bytes per record.
pub const CHUNK_SIZE: usize = 8192;

/// Nonce length for AES-GCM (12 bytes standard).
pub const NONCE_LENGTH: usize = 12;

/// GCM authentication tag length.
pub const TAG_LENGTH: usize = 16;

/// Size of a full record on disk.
pub const RECORD_LENGTH: usize = NONCE_LENGTH + CHUNK_SIZE + TAG_LENGTH;

/// SHA-256 digest of a plaintext.
pub type Digest = [u8; 32];

/// Encrypt `src` into a new file at `dst`.
///
/// Fails with [`CipherError::InputMissing`] if `src` does not exist and with
/// [`CipherError::OutputExists`] if `dst` does. After writing, the output is
/// decrypted again and its digest compared against the source; on mismatch, or on
/// any other failure, `dst` is removed before the error is returned.
///
/// Returns the number of plaintext bytes sealed.
pub fn encrypt_file(src: impl AsRef<Path>, dst: impl AsRef<Path>, key: &DataKey) -> Result<u64> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let input = open_input(src)?;
    let output = create_output(dst, false)?;

    let sealed = (|| -> std::result::Result<u64, CipherError> {
        let mut writer = BufWriter::new(output);
        let (bytes, digest) = encrypt_stream(BufReader::new(input), &mut writer, key, src, dst)?;
        let file = writer
            .into_inner()
            .map_err(|e| io_at(dst)(e.into_error()))?;
        file.sync_all().map_err(io_at(dst))?;

        let readback = File::open(dst).map_err(io_at(dst))?;
        let (_, check) = decrypt_stream(BufReader::new(readback), io::sink(), key, dst, dst)?;
        if check != digest {
            return Err(CipherError::VerificationFailed {
                path: dst.to_path_buf(),
            });
        }
        Ok(bytes)
    })();

    match sealed {
        Ok(bytes) => {
            tracing::debug!(src = %src.display(), dst = %dst.display(), bytes, "Sealed file");
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(dst);
            Err(e.into())
        }
    }
}

/// Decrypt `src` into a new plaintext file at `dst`.
///
/// The plaintext is written to a `.partial` sibling first and only renamed into
/// place once every record has authenticated, so a wrong key or a tampered file
/// never leaves plaintext behind. On Unix the result is mode `0600`.
///
/// Returns the number of plaintext bytes recovered.
pub fn decrypt_file(src: impl AsRef<Path>, dst: impl AsRef<Path>, key: &DataKey) -> Result<u64> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if dst.symlink_metadata().is_ok() {
        return Err(CipherError::OutputExists {
            path: dst.to_path_buf(),
        }
        .into());
    }
    let input = open_input(src)?;

    let partial = sidecar(dst, PARTIAL_SUFFIX);
    remove_if_present(&partial).map_err(io_at(&partial))?;
    let output = create_output(&partial, true)?;

    let opened = (|| -> std::result::Result<u64, CipherError> {
        let mut writer = BufWriter::new(output);
        let (bytes, _) = decrypt_stream(BufReader::new(input), &mut writer, key, src, &partial)?;
        let file = writer
            .into_inner()
            .map_err(|e| io_at(&partial)(e.into_error()))?;
        file.sync_all().map_err(io_at(&partial))?;
        fs::rename(&partial, dst).map_err(io_at(dst))?;
        Ok(bytes)
    })();

    match opened {
        Ok(bytes) => {
            tracing::debug!(src = %src.display(), dst = %dst.display(), bytes, "Opened file");
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e.into())
        }
    }
}

/// Authenticate every record of `src` without writing plaintext anywhere.
///
/// Returns the SHA-256 digest of the plaintext.
pub fn verify_file(src: impl AsRef<Path>, key: &DataKey) -> Result<Digest> {
    let src = src.as_ref();
    let input = open_input(src)?;
    let (_, digest) = decrypt_stream(BufReader::new(input), io::sink(), key, src, src)?;
    Ok(digest)
}

/// Seal an in-memory payload in the same record format as [`encrypt_file`].
pub fn encrypt_bytes(plaintext: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    let label = Path::new("<memory>");
    let mut sealed = Vec::with_capacity(sealed_len(plaintext.len()));
    encrypt_stream(plaintext, &mut sealed, key, label, label)?;
    Ok(sealed)
}

/// Open a payload produced by [`encrypt_bytes`] or read from a sealed file.
pub fn decrypt_bytes(sealed: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    let label = Path::new("<memory>");
    let mut plaintext = Vec::with_capacity(sealed.len());
    decrypt_stream(sealed, &mut plaintext, key, label, label)?;
    Ok(plaintext)
}

/// Size on disk of a plaintext of `len` bytes once sealed.
pub fn sealed_len(len: usize) -> usize {
    let records = len / CHUNK_SIZE + 1;
    len + records * (NONCE_LENGTH + TAG_LENGTH)
}

fn cipher_for(key: &DataKey) -> Aes128Gcm {
    Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key.as_bytes()))
}

fn encrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &DataKey,
    input: &Path,
    output: &Path,
) -> std::result::Result<(u64, Digest), CipherError> {
    let cipher = cipher_for(key);
    let mut hasher = Sha256::new();
    let mut block = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    let mut total = 0u64;

    loop {
        let n = read_full(&mut reader, &mut block).map_err(io_at(input))?;
        hasher.update(&block[..n]);

        let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
        let sealed =
            cipher
                .encrypt(&nonce, &block[..n])
                .map_err(|e| CipherError::EncryptionFailed {
                    reason: e.to_string(),
                })?;
        writer.write_all(&nonce).map_err(io_at(output))?;
        writer.write_all(&sealed).map_err(io_at(output))?;

        total += n as u64;
        if n < CHUNK_SIZE {
            break;
        }
    }

    writer.flush().map_err(io_at(output))?;
    Ok((total, hasher.finalize().into()))
}

fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &DataKey,
    input: &Path,
    output: &Path,
) -> std::result::Result<(u64, Digest), CipherError> {
    let cipher = cipher_for(key);
    let mut hasher = Sha256::new();
    let mut record = vec![0u8; RECORD_LENGTH];
    let mut total = 0u64;
    let mut chunk = 0u64;

    loop {
        let n = read_full(&mut reader, &mut record).map_err(io_at(input))?;
        if n < NONCE_LENGTH + TAG_LENGTH {
            return Err(CipherError::Malformed { chunk, len: n });
        }

        let (nonce, sealed) = record[..n].split_at(NONCE_LENGTH);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| CipherError::InvalidKey { chunk })?,
        );
        hasher.update(&plaintext[..]);
        writer.write_all(&plaintext).map_err(io_at(output))?;

        total += plaintext.len() as u64;
        chunk += 1;
        if n < RECORD_LENGTH {
            break;
        }
    }

    writer.flush().map_err(io_at(output))?;
    Ok((total, hasher.finalize().into()))
}

/// Fill `buf` from `reader`, stopping early only at EOF.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub(crate) fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> CipherError + '_ {
    move |source| CipherError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_input(path: &Path) -> std::result::Result<File, CipherError> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CipherError::InputMissing {
            path: path.to_path_buf(),
        },
        _ => io_at(path)(e),
    })
}

fn create_output(path: &Path, private: bool) -> std::result::Result<File, CipherError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if private {
            options.mode(0o600);
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => CipherError::OutputExists {
            path: path.to_path_buf(),
        },
        _ => io_at(path)(e),
    })
}
