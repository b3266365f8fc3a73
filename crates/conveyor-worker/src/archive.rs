//! Small helpers over uncompressed ustar archives, the wire format for
//! everything streamed in and out of containers.

use bytes::Bytes;
use futures::StreamExt;
use std::io::Read;

use conveyor_core::{Error, Result};

use crate::runtime::TarStream;

/// An archive with no entries. Streaming it into a container creates
/// the target directory and nothing else.
pub fn empty_tar() -> Bytes {
    let mut data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut data);
        // writing the trailer into a Vec cannot fail
        let _ = builder.finish();
    }
    Bytes::from(data)
}

/// An archive holding a single regular file.
pub fn single_file_tar(name: &str, contents: &[u8]) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents)?;
    let data = builder.into_inner()?;
    Ok(Bytes::from(data))
}

/// Buffers a tar stream into memory.
pub async fn collect(mut stream: TarStream) -> Result<Bytes> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(data))
}

/// Contents of the archive's first entry, or `FileNotFound` for the
/// given path when the archive is empty.
pub fn first_entry(archive: &[u8], path: &str) -> Result<Bytes> {
    let mut reader = tar::Archive::new(archive);
    for entry in reader.entries()? {
        let mut entry = entry?;
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        return Ok(Bytes::from(contents));
    }

    Err(Error::FileNotFound {
        path: path.to_string(),
    })
}
