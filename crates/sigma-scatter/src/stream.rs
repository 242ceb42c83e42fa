//! Fixed-size chunk streaming through one reusable leased buffer.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use sigma_core::SigmaResult;
use tracing::{debug, warn};

use crate::buffer::MemoryBudget;

/// Fill `buf` from `reader`, stopping short only at end of input.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone)]
pub struct StreamingProcessor {
    chunk_size: usize,
    budget: Arc<MemoryBudget>,
    timeout: Duration,
}

impl StreamingProcessor {
    pub fn new(chunk_size: usize, budget: Arc<MemoryBudget>, timeout: Duration) -> Self {
        Self {
            chunk_size,
            budget,
            timeout,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Call `f(index, chunk)` for each chunk of `reader`. Every chunk but the
    /// last is exactly `chunk_size` bytes. Returns the number of bytes read.
    ///
    /// `total_size` is a hint for logging; a mismatch is reported, not fatal.
    pub fn for_each_chunk<R, F>(&self, reader: R, total_size: Option<u64>, f: F) -> SigmaResult<u64>
    where
        R: Read,
        F: FnMut(u64, &[u8]) -> SigmaResult<()>,
    {
        let mut lease = self
            .budget
            .allocate_with_backpressure(self.chunk_size, self.timeout)?;
        self.run(reader, total_size, &mut lease, f)
    }

    /// Transform `input` chunk by chunk in place and write each result to
    /// `output`. Returns the number of bytes written.
    ///
    /// Input and work buffers come from a single lease.
    pub fn process_stream<R, W, F>(
        &self,
        input: R,
        mut output: W,
        mut chunk_fn: F,
        total_size: Option<u64>,
    ) -> SigmaResult<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(u64, &mut [u8]) -> SigmaResult<()>,
    {
        let mut lease = self
            .budget
            .allocate_with_backpressure(self.chunk_size.saturating_mul(2), self.timeout)?;
        let (read_buf, work) = lease.split_at_mut(self.chunk_size);
        let mut written = 0u64;
        self.run(input, total_size, read_buf, |index, chunk| {
            let out = &mut work[..chunk.len()];
            out.copy_from_slice(chunk);
            chunk_fn(index, out)?;
            output.write_all(out)?;
            written += out.len() as u64;
            Ok(())
        })?;
        output.flush()?;
        Ok(written)
    }

    fn run<R, F>(&self, mut reader: R, total_size: Option<u64>, buf: &mut [u8], mut f: F) -> SigmaResult<u64>
    where
        R: Read,
        F: FnMut(u64, &[u8]) -> SigmaResult<()>,
    {
        let mut index = 0u64;
        let mut total = 0u64;
        loop {
            let n = read_full(&mut reader, buf)?;
            if n == 0 {
                break;
            }
            debug!(chunk = index, len = n, "stream chunk");
            f(index, &buf[..n])?;
            total += n as u64;
            index += 1;
            if n < self.chunk_size {
                break;
            }
        }
        if let Some(expected) = total_size {
            if expected != total {
                warn!(expected, actual = total, "stream length differs from declared size");
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigma_core::SigmaError;
    use std::io::Cursor;

    /// Reader that hands out at most 3 bytes per call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(3).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    fn processor(chunk: usize, ceiling: usize) -> StreamingProcessor {
        StreamingProcessor::new(chunk, MemoryBudget::new(ceiling), Duration::from_millis(100))
    }

    #[test]
    fn test_chunks_are_full_except_last() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let p = processor(64, 1 << 20);
        let mut sizes = Vec::new();
        let mut joined = Vec::new();
        let total = p
            .for_each_chunk(Trickle(&data), Some(1000), |i, c| {
                assert_eq!(i as usize, sizes.len());
                sizes.push(c.len());
                joined.extend_from_slice(c);
                Ok(())
            })
            .unwrap();
        assert_eq!(total, 1000);
        assert_eq!(joined, data);
        assert!(sizes[..sizes.len() - 1].iter().all(|s| *s == 64));
        assert_eq!(*sizes.last().unwrap(), 1000 % 64);
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let p = processor(64, 1024);
        let mut calls = 0;
        let total = p
            .for_each_chunk(Cursor::new(Vec::<u8>::new()), None, |_, _| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!((total, calls), (0, 0));
    }

    #[test]
    fn test_exact_multiple() {
        let p = processor(10, 1024);
        let mut count = 0;
        p.for_each_chunk(Cursor::new(vec![1u8; 30]), None, |_, c| {
            assert_eq!(c.len(), 10);
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_callback_error_stops_and_releases() {
        let p = processor(8, 64);
        let err = p
            .for_each_chunk(Cursor::new(vec![0u8; 100]), None, |i, _| {
                if i == 2 {
                    Err(SigmaError::format("stop"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, SigmaError::Format(_)));
        assert_eq!(p.budget.in_use(), 0);
    }

    #[test]
    fn test_chunk_larger_than_ceiling_refused() {
        let p = processor(128, 64);
        assert!(matches!(
            p.for_each_chunk(Cursor::new(vec![0u8; 10]), None, |_, _| Ok(())),
            Err(SigmaError::Allocation { .. })
        ));
    }

    #[test]
    fn test_process_stream_bounded() {
        let data = vec![0x0Fu8; 100_000];
        let p = processor(4096, 2 * 4096);
        let mut out = Vec::new();
        let written = p
            .process_stream(
                Cursor::new(&data),
                &mut out,
                |_, chunk| {
                    chunk.iter_mut().for_each(|b| *b ^= 0xFF);
                    Ok(())
                },
                Some(data.len() as u64),
            )
            .unwrap();
        assert_eq!(written, 100_000);
        assert!(out.iter().all(|b| *b == 0xF0));
        assert!(p.budget.peak() <= 2 * 4096);
    }
}
