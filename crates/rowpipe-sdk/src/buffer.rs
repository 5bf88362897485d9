//! Row buffer that hands out full chunks

use crate::table::Row;
use crate::writer::Chunk;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    rows: Vec<Box<dyn Row>>,
    /// Rows already handed out in chunks, including chunks not yet written
    reserved: u64,
}

/// Rows swapped out of the buffer, with their chunk number already reserved
#[derive(Debug)]
pub struct PendingChunk {
    pub chunk_number: u64,
    pub rows: Vec<Box<dyn Row>>,
}

impl PendingChunk {
    pub fn into_chunk(self, execution_id: &str) -> serde_json::Result<Chunk> {
        let mut data = Vec::with_capacity(self.rows.len() * 256);
        for row in &self.rows {
            row.write_json(&mut data)?;
            data.push(b'\n');
        }
        Ok(Chunk {
            execution_id: execution_id.to_string(),
            chunk_number: self.chunk_number,
            row_count: self.rows.len(),
            data,
        })
    }
}

/// Accumulates rows and swaps them out in `chunk_size` batches.
///
/// The lock is held only to push or swap; serializing and writing the
/// swapped-out rows happens outside it.
#[derive(Debug)]
pub struct RowBuffer {
    chunk_size: usize,
    inner: Mutex<Inner>,
}

impl RowBuffer {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            inner: Mutex::new(Inner {
                rows: Vec::with_capacity(chunk_size.min(1024)),
                reserved: 0,
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Append a row, returning a full chunk when this row completes one
    pub fn push(&self, row: Box<dyn Row>) -> Option<PendingChunk> {
        let mut inner = self.lock();
        inner.rows.push(row);
        if inner.rows.len() >= self.chunk_size {
            Some(Self::swap(&mut inner, self.chunk_size))
        } else {
            None
        }
    }

    /// Take whatever is buffered as the final, possibly partial, chunk
    pub fn take_remaining(&self) -> Option<PendingChunk> {
        let mut inner = self.lock();
        if inner.rows.is_empty() {
            None
        } else {
            Some(Self::swap(&mut inner, self.chunk_size))
        }
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn swap(inner: &mut Inner, chunk_size: usize) -> PendingChunk {
        let rows = std::mem::replace(&mut inner.rows, Vec::with_capacity(chunk_size.min(1024)));
        let chunk_number = inner.reserved / chunk_size as u64;
        inner.reserved += rows.len() as u64;
        PendingChunk { chunk_number, rows }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rowpipe_common::types::CommonFields;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NumberRow(u64, CommonFields);

    impl Row for NumberRow {
        fn common_fields(&self) -> &CommonFields {
            &self.1
        }

        fn write_json(&self, out: &mut dyn Write) -> serde_json::Result<()> {
            serde_json::to_writer(out, &self.0)
        }
    }

    fn row(n: u64) -> Box<dyn Row> {
        Box::new(NumberRow(n, CommonFields::default()))
    }

    #[test]
    fn test_exact_chunk_size_yields_one_chunk() {
        let buffer = RowBuffer::new(3);
        assert!(buffer.push(row(1)).is_none());
        assert!(buffer.push(row(2)).is_none());
        let chunk = buffer.push(row(3)).unwrap();
        assert_eq!(chunk.chunk_number, 0);
        assert_eq!(chunk.rows.len(), 3);
        assert!(buffer.take_remaining().is_none());
    }

    #[test]
    fn test_trailing_row_becomes_second_chunk() {
        let buffer = RowBuffer::new(3);
        let mut chunks: Vec<_> = (1..=4).filter_map(|n| buffer.push(row(n))).collect();
        chunks.extend(buffer.take_remaining());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].chunk_number, 1);
        assert_eq!(chunks[1].rows.len(), 1);
    }

    #[test]
    fn test_into_chunk_writes_json_lines_in_order() {
        let buffer = RowBuffer::new(10);
        for n in [5, 6, 7] {
            buffer.push(row(n));
        }
        let chunk = buffer.take_remaining().unwrap().into_chunk("exec").unwrap();
        assert_eq!(chunk.data, b"5\n6\n7\n");
        assert_eq!(chunk.row_count, 3);
        assert_eq!(chunk.execution_id, "exec");
    }

    #[test]
    fn test_concurrent_pushes_reserve_distinct_chunk_numbers() {
        let buffer = Arc::new(RowBuffer::new(10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter_map(|n| buffer.push(row(t * 1000 + n)))
                        .map(|c| c.chunk_number)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut numbers: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..80).collect::<Vec<_>>());
        assert!(buffer.is_empty());
    }
}
