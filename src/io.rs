// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers.

Stream adapters for digest verification and transparent decompression. The
pipeline verifies SHA-256 exclusively, so that is the only digest flavor
modeled here.
*/

use {
    crate::error::{BuildError, Result},
    async_compression::futures::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder},
    futures::{AsyncBufRead, AsyncRead},
    pin_project::pin_project,
    sha2::{Digest, Sha256},
    std::{
        fmt::{Display, Formatter},
        io::Read,
        pin::Pin,
        task::{Context, Poll},
    },
};

/// A SHA-256 content digest.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct ContentDigest(Vec<u8>);

impl ContentDigest {
    /// Construct an instance by parsing a hex digest string.
    pub fn from_hex(digest: &str) -> Result<Self> {
        Ok(Self(hex::decode(digest)?))
    }

    /// Digest raw data.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Display for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha256({})", self.as_hex())
    }
}

/// An [AsyncRead] adapter that validates content size and digest.
///
/// Validation fires once the expected number of bytes has been read.
/// Readers must drain the stream to completion or no validation occurs.
#[pin_project]
pub struct ValidatingReader<R> {
    hasher: Option<Sha256>,
    expected_size: u64,
    expected_digest: ContentDigest,
    context: String,
    bytes_read: u64,
    #[pin]
    source: R,
}

impl<R> ValidatingReader<R> {
    /// Create an instance bound to a source.
    ///
    /// `context` names the URL or path for error messages.
    pub fn new(
        source: R,
        expected_size: u64,
        expected_digest: ContentDigest,
        context: impl Into<String>,
    ) -> Self {
        Self {
            hasher: Some(Sha256::new()),
            expected_size,
            expected_digest,
            context: context.into(),
            bytes_read: 0,
            source,
        }
    }
}

impl<R> AsyncRead for ValidatingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut this = self.project();

        match this.source.as_mut().poll_read(cx, buf) {
            Poll::Ready(Ok(size)) => {
                if size > 0 {
                    if let Some(hasher) = this.hasher.as_mut() {
                        hasher.update(&buf[0..size]);
                    }

                    *this.bytes_read += size as u64;
                }

                match (*this.bytes_read).cmp(&*this.expected_size) {
                    std::cmp::Ordering::Equal => {
                        if let Some(hasher) = this.hasher.take() {
                            let got = hasher.finalize();

                            if got.as_slice() != this.expected_digest.as_bytes() {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::InvalidData,
                                    BuildError::HashMismatch {
                                        url: this.context.clone(),
                                        expected: this.expected_digest.as_hex(),
                                        actual: hex::encode(got),
                                    },
                                )));
                            }
                        }
                    }
                    std::cmp::Ordering::Greater => {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            BuildError::SizeMismatch {
                                url: this.context.clone(),
                                expected: *this.expected_size,
                                actual: *this.bytes_read,
                            },
                        )));
                    }
                    std::cmp::Ordering::Less => {}
                }

                Poll::Ready(Ok(size))
            }
            res => res,
        }
    }
}

/// A synchronous [Read] adapter computing a SHA-256 digest of the bytes
/// that pass through it.
pub struct HashingReader<R> {
    hasher: Sha256,
    source: R,
}

impl<R: Read> HashingReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            hasher: Sha256::new(),
            source,
        }
    }

    /// Finish the stream, returning the digest of everything read.
    pub fn finish(self) -> ContentDigest {
        ContentDigest(self.hasher.finalize().to_vec())
    }

    /// Verify the digest of everything read against a hex digest.
    pub fn verify(self, expected_hex: &str, context: &str) -> Result<()> {
        let actual = self.finish();
        let expected = ContentDigest::from_hex(expected_hex)?;

        if actual == expected {
            Ok(())
        } else {
            Err(BuildError::HashMismatch {
                url: context.to_string(),
                expected: expected.as_hex(),
                actual: actual.as_hex(),
            })
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.source.read(buf)?;
        if size > 0 {
            self.hasher.update(&buf[0..size]);
        }

        Ok(size)
    }
}

/// Compression formats used by repository indices and `.deb` members.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// XZ compression (`.xz`).
    Xz,

    /// Gzip compression (`.gz`).
    Gzip,

    /// Zstandard compression (`.zst`).
    Zstd,

    /// Bzip2 compression (`.bz2`).
    Bzip2,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
            Self::Bzip2 => ".bz2",
        }
    }

    /// Client retrieval preference, most compressed first.
    pub fn preferred_order() -> impl Iterator<Item = Compression> {
        [Self::Xz, Self::Zstd, Self::Gzip, Self::Bzip2, Self::None].into_iter()
    }

    /// Determine the compression of an archive member from its name.
    pub fn from_member_name(name: &str) -> Result<Self> {
        Ok(if name.ends_with(".xz") {
            Self::Xz
        } else if name.ends_with(".gz") {
            Self::Gzip
        } else if name.ends_with(".zst") {
            Self::Zstd
        } else if name.ends_with(".bz2") {
            Self::Bzip2
        } else if name.ends_with(".tar") || !name.contains(".tar.") {
            Self::None
        } else {
            return Err(BuildError::DebUnknownCompression(name.to_string()));
        })
    }
}

/// Wrap an async reader with transparent decompression.
pub fn read_decompressed(
    stream: Pin<Box<dyn AsyncBufRead + Send>>,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
        Compression::Xz => Box::pin(XzDecoder::new(stream)),
        Compression::Zstd => Box::pin(ZstdDecoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(stream)),
    }
}

/// Append a tar entry under an exact name.
///
/// Debian archive entries begin with `./`, but [tar::Builder::append_data]
/// normalizes that prefix away. The name is copied into the header field
/// directly; names too long for the field are carried by a GNU `@LongLink`
/// entry first.
pub fn append_tar_entry<W: std::io::Write, R: Read>(
    builder: &mut tar::Builder<W>,
    header: &mut tar::Header,
    name: &str,
    data: R,
) -> std::io::Result<()> {
    let name_bytes = name.as_bytes();

    if name_bytes.len() > header.as_old().name.len() {
        let mut long = tar::Header::new_gnu();
        {
            let gnu = long.as_gnu_mut().expect("fresh gnu header");
            let link = b"././@LongLink";
            gnu.name[..link.len()].copy_from_slice(link);
        }
        long.set_mode(0o644);
        long.set_uid(0);
        long.set_gid(0);
        long.set_mtime(0);
        long.set_size(name_bytes.len() as u64 + 1);
        long.set_entry_type(tar::EntryType::new(b'L'));
        long.set_cksum();
        builder.append(&long, name_bytes.chain(std::io::repeat(0).take(1)))?;
    }

    {
        let field = &mut header.as_old_mut().name;
        let len = name_bytes.len().min(field.len());
        field[..len].copy_from_slice(&name_bytes[..len]);
    }

    header.set_cksum();
    builder.append(&*header, data)
}

/// Decompress an in-memory buffer synchronously.
///
/// The unpacker operates on whole `.deb` members, which are small enough to
/// buffer.
pub fn decompress_buffer(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    match compression {
        Compression::None => out.extend_from_slice(data),
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Xz => {
            xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Zstd => {
            zstd::stream::read::Decoder::new(data)?.read_to_end(&mut out)?;
        }
        Compression::Bzip2 => {
            return Err(BuildError::DebUnknownCompression(
                "bzip2 .deb members are not supported".to_string(),
            ));
        }
    }

    Ok(out)
}
