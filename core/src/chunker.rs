use crate::types::ChunkerParams;
use crate::{Error, Result};
use fastcdc::v2020::{FastCDC, StreamCDC};
use std::io::Read;

/// Content-defined chunker (FastCDC 2020). Boundaries depend only on the
/// input bytes and the size parameters.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl Chunker {
    pub fn new(avg_size: u32) -> Self {
        Self::from_params(ChunkerParams::with_average(avg_size))
    }

    pub fn from_params(params: ChunkerParams) -> Self {
        Self {
            min_size: params.min_size,
            avg_size: params.avg_size,
            max_size: params.max_size,
        }
    }

    pub fn params(&self) -> ChunkerParams {
        ChunkerParams {
            min_size: self.min_size,
            avg_size: self.avg_size,
            max_size: self.max_size,
        }
    }

    pub fn chunk_data(&self, data: &[u8]) -> Vec<Chunk> {
        if data.is_empty() {
            return Vec::new();
        }
        let chunker = FastCDC::new(data, self.min_size, self.avg_size, self.max_size);
        chunker
            .map(|chunk| Chunk {
                offset: chunk.offset,
                length: chunk.length,
                data: data[chunk.offset..chunk.offset + chunk.length].to_vec(),
            })
            .collect()
    }

    /// Lazily chunks a reader; holds at most one `max_size` window in memory.
    pub fn chunk_reader<R: Read>(&self, reader: R) -> ChunkStream<R> {
        ChunkStream {
            inner: StreamCDC::new(reader, self.min_size, self.avg_size, self.max_size),
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::from_params(ChunkerParams::default())
    }
}

pub struct ChunkStream<R: Read> {
    inner: StreamCDC<R>,
}

impl<R: Read> Iterator for ChunkStream<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(
            item.map(|chunk| Chunk {
                offset: chunk.offset as usize,
                length: chunk.length,
                data: chunk.data,
            })
            .map_err(|e| match e {
                fastcdc::v2020::Error::IoError(err) => Error::Io(err),
                other => Error::Other(format!("chunker: {other}")),
            }),
        )
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: usize,
    pub length: usize,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn id(&self) -> crate::ChunkID {
        crate::ChunkID::from(blake3::hash(&self.data))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
