//! Concatenate standalone trace files into one archive.
//!
//! The archive header records how many traces follow and one
//! `(fid, trace_size, offset)` triple per trace; the trace bodies are
//! byte-identical to the standalone files, so `split` can carve them back
//! out without understanding their contents.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use litl::types::{ARCHIVE_FLAG_OFFSET, ARCHIVE_TRIPLES_OFFSET, TRIPLE_SIZE};
use log::info;

/// Copy block for shoveling trace bodies into the archive.
const COPY_BLOCK: usize = 16 * 1024 * 1024;

pub fn merge(output: &Path, inputs: &[PathBuf]) -> Result<()> {
    if inputs.is_empty() {
        bail!("no input traces to merge");
    }
    if inputs.len() > u16::MAX as usize {
        bail!("too many input traces ({})", inputs.len());
    }

    let out = File::create(output)
        .with_context(|| format!("cannot create archive {}", output.display()))?;

    let mut header = vec![0u8; ARCHIVE_TRIPLES_OFFSET + inputs.len() * TRIPLE_SIZE];
    header[..2].copy_from_slice(&(inputs.len() as u16).to_le_bytes());
    header[ARCHIVE_FLAG_OFFSET] = 1;

    let mut general_offset = header.len() as u64;
    let mut block = vec![0u8; COPY_BLOCK];
    for (fid, input) in inputs.iter().enumerate() {
        let mut trace =
            File::open(input).with_context(|| format!("cannot open {}", input.display()))?;
        let size = trace
            .metadata()
            .with_context(|| format!("cannot stat {}", input.display()))?
            .len();

        let at = ARCHIVE_TRIPLES_OFFSET + fid * TRIPLE_SIZE;
        header[at..at + 2].copy_from_slice(&(fid as u16).to_le_bytes());
        header[at + 2..at + 10].copy_from_slice(&size.to_le_bytes());
        header[at + 10..at + 18].copy_from_slice(&general_offset.to_le_bytes());

        loop {
            let n = trace
                .read(&mut block)
                .with_context(|| format!("cannot read {}", input.display()))?;
            if n == 0 {
                break;
            }
            out.write_all_at(&block[..n], general_offset)
                .context("cannot write to the archive")?;
            general_offset += n as u64;
        }
        info!("merged {} ({size} bytes)", input.display());
    }

    // triples are complete only now, so the header goes in last
    out.write_all_at(&header, 0)
        .context("cannot write the archive header")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::split;

    fn write_trace(path: &Path, codes: &[u32]) {
        let mut trace = litl::Trace::with_config(4096, litl::Config::default());
        trace.set_filename(path);
        for &code in codes {
            trace.probe1(code, 7);
        }
        trace.finalize();
    }

    #[test]
    fn merge_then_split_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.trace");
        let b = dir.path().join("b.trace");
        write_trace(&a, &[0x10, 0x11, 0x12]);
        write_trace(&b, &[0x20]);

        let archive = dir.path().join("all.arch");
        merge(&archive, &[a.clone(), b.clone()]).unwrap();

        let out = dir.path().join("out");
        split(&archive, &out).unwrap();

        let a_bytes = std::fs::read(&a).unwrap();
        let b_bytes = std::fs::read(&b).unwrap();
        assert_eq!(std::fs::read(out.join("trace_0.litl")).unwrap(), a_bytes);
        assert_eq!(std::fs::read(out.join("trace_1.litl")).unwrap(), b_bytes);

        // the extracted copies are complete traces again
        let mut reader = litl::TraceReader::open(out.join("trace_0.litl")).unwrap();
        let events = reader.read_all().unwrap();
        assert_eq!(
            events.iter().map(|e| e.code).collect::<Vec<_>>(),
            vec![0x10, 0x11, 0x12]
        );
    }

    #[test]
    fn archive_header_describes_every_trace() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.trace");
        let b = dir.path().join("b.trace");
        write_trace(&a, &[1]);
        write_trace(&b, &[2, 3]);
        let a_len = std::fs::metadata(&a).unwrap().len();
        let b_len = std::fs::metadata(&b).unwrap().len();

        let archive = dir.path().join("all.arch");
        merge(&archive, &[a, b]).unwrap();

        let bytes = std::fs::read(&archive).unwrap();
        assert_eq!(u16::from_le_bytes(bytes[..2].try_into().unwrap()), 2);
        assert_eq!(bytes[ARCHIVE_FLAG_OFFSET], 1);

        let header_len = (ARCHIVE_TRIPLES_OFFSET + 2 * TRIPLE_SIZE) as u64;
        let triple = |i: usize| {
            let at = ARCHIVE_TRIPLES_OFFSET + i * TRIPLE_SIZE;
            (
                u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap()),
                u64::from_le_bytes(bytes[at + 2..at + 10].try_into().unwrap()),
                u64::from_le_bytes(bytes[at + 10..at + 18].try_into().unwrap()),
            )
        };
        assert_eq!(triple(0), (0, a_len, header_len));
        assert_eq!(triple(1), (1, b_len, header_len + a_len));
        assert_eq!(bytes.len() as u64, header_len + a_len + b_len);
    }

    #[test]
    fn merge_refuses_empty_input_list() {
        let dir = tempfile::tempdir().unwrap();
        assert!(merge(&dir.path().join("x.arch"), &[]).is_err());
    }
}
