//! Extract the standalone traces embedded in an archive.

use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use litl::types::{ARCHIVE_FLAG_OFFSET, ARCHIVE_TRIPLES_OFFSET, TRIPLE_SIZE};
use log::info;

const COPY_BLOCK: usize = 16 * 1024 * 1024;

pub fn split(archive: &Path, out_dir: &Path) -> Result<()> {
    let arch =
        File::open(archive).with_context(|| format!("cannot open {}", archive.display()))?;

    let mut head = [0u8; ARCHIVE_TRIPLES_OFFSET];
    arch.read_exact_at(&mut head, 0)
        .context("cannot read the archive header")?;
    if head[ARCHIVE_FLAG_OFFSET] != 1 {
        bail!(
            "{} is not an archive of traces (did you pass a plain trace file?)",
            archive.display()
        );
    }
    let nb_traces = u16::from_le_bytes(head[..2].try_into().unwrap()) as usize;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let mut block = vec![0u8; COPY_BLOCK];
    for i in 0..nb_traces {
        let mut triple = [0u8; TRIPLE_SIZE];
        arch.read_exact_at(&mut triple, (ARCHIVE_TRIPLES_OFFSET + i * TRIPLE_SIZE) as u64)
            .context("cannot read a header triple")?;
        let fid = u16::from_le_bytes(triple[..2].try_into().unwrap());
        let size = u64::from_le_bytes(triple[2..10].try_into().unwrap());
        let offset = u64::from_le_bytes(triple[10..18].try_into().unwrap());

        let out_path = out_dir.join(format!("trace_{fid}.litl"));
        let out = File::create(&out_path)
            .with_context(|| format!("cannot create {}", out_path.display()))?;

        let mut copied = 0u64;
        while copied < size {
            let want = block.len().min((size - copied) as usize);
            arch.read_exact_at(&mut block[..want], offset + copied)
                .with_context(|| format!("archive truncated while extracting trace {fid}"))?;
            out.write_all_at(&block[..want], copied)
                .with_context(|| format!("cannot write {}", out_path.display()))?;
            copied += want as u64;
        }
        info!("extracted trace {fid} to {} ({size} bytes)", out_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_plain_trace_files() {
        let dir = tempfile::tempdir().unwrap();
        let trace = dir.path().join("plain.trace");
        let mut t = litl::Trace::with_config(4096, litl::Config::default());
        t.set_filename(&trace);
        t.probe0(1);
        t.finalize();

        let err = split(&trace, dir.path()).unwrap_err();
        assert!(err.to_string().contains("not an archive"));
    }

    #[test]
    fn rejects_truncated_archives() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("short.arch");
        std::fs::write(&archive, [0u8; 1]).unwrap();
        assert!(split(&archive, dir.path()).is_err());
    }
}
