//! Built-in Raw-Input Actions
//!
//! The two in-process actions that materialize a sample's raw reads:
//! - [`link_raw`]: symlink the single raw file
//! - [`pool_and_sort`]: merge every lane's FASTQ records and sort them by
//!   read identifier, so the result does not depend on lane order. Inputs
//!   beyond one chunk are sorted externally in runs and merged.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, info, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One FASTQ record, kept as its original four lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    /// First whitespace-delimited token of the header line
    pub id: String,
    pub text: String,
}

impl Ord for FastqRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.text.cmp(&other.text))
    }
}

impl PartialOrd for FastqRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn prepare_dest(dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    Ok(())
}

/// Points `dest` at `source`, replacing whatever `dest` was.
pub fn link_raw(source: &Path, dest: &Path) -> io::Result<()> {
    prepare_dest(dest)?;
    let source = fs::canonicalize(source)?;

    #[cfg(unix)]
    std::os::unix::fs::symlink(&source, dest)?;
    #[cfg(not(unix))]
    fs::copy(&source, dest).map(|_| ())?;

    debug!("Linked {} -> {}", dest.display(), source.display());
    Ok(())
}

/// Opens a FASTQ file, decompressing when it starts with the gzip magic.
fn open_fastq(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let mut reader = BufReader::new(File::open(path)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

fn invalid(path: &Path, line: usize, reason: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}:{}: {}", path.display(), line, reason),
    )
}

/// Streams 4-line records from a plain or gzipped FASTQ file.
pub struct FastqReader {
    path: PathBuf,
    reader: Box<dyn BufRead>,
    line_no: usize,
}

impl FastqReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            reader: open_fastq(path)?,
            line_no: 0,
        })
    }

    pub fn next_record(&mut self) -> io::Result<Option<FastqRecord>> {
        let mut lines = [String::new(), String::new(), String::new(), String::new()];
        let mut read = 0;
        for line in lines.iter_mut() {
            if self.reader.read_line(line)? == 0 {
                break;
            }
            read += 1;
        }
        self.line_no += read;

        match read {
            0 => return Ok(None),
            4 => {}
            _ => return Err(invalid(&self.path, self.line_no, "truncated FASTQ record")),
        }

        if !lines[0].starts_with('@') {
            return Err(invalid(&self.path, self.line_no - 3, "header line must start with '@'"));
        }
        if !lines[2].starts_with('+') {
            return Err(invalid(&self.path, self.line_no - 1, "separator line must start with '+'"));
        }

        let mut text = String::new();
        for line in &lines {
            text.push_str(line.trim_end_matches(['\n', '\r']));
            text.push('\n');
        }
        let id = lines[0].split_whitespace().next().unwrap_or("").to_string();
        Ok(Some(FastqRecord { id, text }))
    }
}

/// Reads every 4-line record of a FASTQ file.
pub fn read_records(path: &Path) -> io::Result<Vec<FastqRecord>> {
    let mut reader = FastqReader::open(path)?;
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        records.push(record);
    }
    Ok(records)
}

/// Records held in memory before a sorted run is spilled to disk.
pub const SORT_CHUNK_RECORDS: usize = 1_000_000;

/// Sorted runs spilled next to the destination; removed on drop.
struct SpillDir {
    path: PathBuf,
    runs: Vec<PathBuf>,
}

impl SpillDir {
    fn for_dest(dest: &Path) -> Self {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: dest.with_file_name(format!(".{}.sort", name)),
            runs: Vec::new(),
        }
    }

    /// Sorts `chunk`, writes it as the next run and empties it.
    fn spill(&mut self, chunk: &mut Vec<FastqRecord>) -> io::Result<()> {
        if self.runs.is_empty() {
            fs::create_dir_all(&self.path)?;
        }
        chunk.sort();

        let run = self.path.join(format!("run_{:05}.fq", self.runs.len()));
        let mut out = BufWriter::new(File::create(&run)?);
        write_records(chunk, &mut out)?;
        out.flush()?;

        debug!("Spilled {} sorted records to {}", chunk.len(), run.display());
        chunk.clear();
        self.runs.push(run);
        Ok(())
    }
}

impl Drop for SpillDir {
    fn drop(&mut self) {
        if self.runs.is_empty() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("Could not remove sort runs in {}: {}", self.path.display(), e);
        }
    }
}

/// K-way merge of sorted run files.
fn merge_runs(runs: &[PathBuf], out: &mut dyn Write) -> io::Result<()> {
    let mut readers = runs
        .iter()
        .map(|run| FastqReader::open(run))
        .collect::<io::Result<Vec<_>>>()?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (i, reader) in readers.iter_mut().enumerate() {
        if let Some(record) = reader.next_record()? {
            heap.push(Reverse((record, i)));
        }
    }

    while let Some(Reverse((record, i))) = heap.pop() {
        out.write_all(record.text.as_bytes())?;
        if let Some(next) = readers[i].next_record()? {
            heap.push(Reverse((next, i)));
        }
    }
    Ok(())
}

/// Merges `sources` into `dest`, sorted by read identifier.
///
/// The output is byte-identical for any ordering of `sources`. It is
/// gzip-compressed when `dest` ends in `.gz`. A single source is linked
/// instead of rewritten.
pub fn pool_and_sort(sources: &[PathBuf], dest: &Path) -> io::Result<()> {
    pool_and_sort_chunked(sources, dest, SORT_CHUNK_RECORDS)
}

/// [`pool_and_sort`] holding at most `chunk_records` records in memory.
///
/// Larger inputs are sorted in runs on disk and merged.
pub fn pool_and_sort_chunked(
    sources: &[PathBuf],
    dest: &Path,
    chunk_records: usize,
) -> io::Result<()> {
    if let [single] = sources {
        return link_raw(single, dest);
    }

    prepare_dest(dest)?;
    let chunk_records = chunk_records.max(1);
    let mut spill = SpillDir::for_dest(dest);
    let mut chunk = Vec::with_capacity(chunk_records.min(SORT_CHUNK_RECORDS));
    let mut total = 0;

    for source in sources {
        let mut reader = FastqReader::open(source)?;
        let before = total;
        while let Some(record) = reader.next_record()? {
            chunk.push(record);
            total += 1;
            if chunk.len() >= chunk_records {
                spill.spill(&mut chunk)?;
            }
        }
        debug!("Read {} records from {}", total - before, source.display());
    }

    if !spill.runs.is_empty() && !chunk.is_empty() {
        spill.spill(&mut chunk)?;
    }
    chunk.sort();

    let emit = |out: &mut dyn Write| -> io::Result<()> {
        if spill.runs.is_empty() {
            write_records(&chunk, out)
        } else {
            merge_runs(&spill.runs, out)
        }
    };

    let file = BufWriter::new(File::create(dest)?);
    let gzip = dest.extension().and_then(|e| e.to_str()) == Some("gz");

    if gzip {
        let mut encoder = GzEncoder::new(file, Compression::default());
        emit(&mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        emit(&mut file)?;
        file.flush()?;
    }

    info!(
        "Pooled {} records from {} files into {} ({} sorted runs)",
        total,
        sources.len(),
        dest.display(),
        spill.runs.len().max(1)
    );
    Ok(())
}

fn write_records(records: &[FastqRecord], out: &mut dyn Write) -> io::Result<()> {
    for record in records {
        out.write_all(record.text.as_bytes())?;
    }
    Ok(())
}

/// Reads a whole FASTQ file, decompressed, as text.
pub fn read_fastq_text(path: &Path) -> io::Result<String> {
    let mut text = String::new();
    open_fastq(path)?.read_to_string(&mut text)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_gz(path: &Path, content: &str) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::fast());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    fn lanes(dir: &Path) -> Vec<PathBuf> {
        let l1 = dir.join("L001_R1.fastq.gz");
        let l2 = dir.join("L002_R1.fastq.gz");
        let l3 = dir.join("L003_R1.fastq");
        write_gz(
            &l1,
            "@read7 1:N:0\nACGT\n+\nIIII\n@read2 1:N:0\nGGGG\n+\nIIII\n",
        );
        write_gz(&l2, "@read5 1:N:0\nTTTT\n+\nIIII\n@read1 1:N:0\nCCCC\n+\nIIII\n");
        fs::write(&l3, "@read3 1:N:0\nAAAA\n+\n!!!!\n").unwrap();
        vec![l1, l2, l3]
    }

    #[test]
    fn test_read_records() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let records = read_records(&files[0]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "@read7");
        assert_eq!(records[0].text, "@read7 1:N:0\nACGT\n+\nIIII\n");
    }

    #[test]
    fn test_pool_and_sort_orders_by_read_id() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let dest = dir.path().join("out/S1_R1.fastq.gz");

        pool_and_sort(&files, &dest).unwrap();

        let text = read_fastq_text(&dest).unwrap();
        let ids: Vec<&str> = text
            .lines()
            .step_by(4)
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(ids, vec!["@read1", "@read2", "@read3", "@read5", "@read7"]);
    }

    #[test]
    fn test_pool_and_sort_independent_of_lane_order() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let permutations = [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]];

        let mut outputs = Vec::new();
        for (i, order) in permutations.iter().enumerate() {
            let sources: Vec<PathBuf> = order.iter().map(|&j| files[j].clone()).collect();
            let dest = dir.path().join(format!("perm{}.fastq.gz", i));
            pool_and_sort(&sources, &dest).unwrap();
            outputs.push(fs::read(&dest).unwrap());
        }

        for output in &outputs[1..] {
            assert_eq!(output, &outputs[0]);
        }
    }

    #[test]
    fn test_duplicate_ids_tie_break_on_record() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.fq");
        let b = dir.path().join("b.fq");
        fs::write(&a, "@r1\nTTTT\n+\nIIII\n").unwrap();
        fs::write(&b, "@r1\nAAAA\n+\nIIII\n").unwrap();

        let ab = dir.path().join("ab.fq");
        let ba = dir.path().join("ba.fq");
        pool_and_sort(&[a.clone(), b.clone()], &ab).unwrap();
        pool_and_sort(&[b, a], &ba).unwrap();

        assert_eq!(fs::read(&ab).unwrap(), fs::read(&ba).unwrap());
        assert!(fs::read_to_string(&ab).unwrap().starts_with("@r1\nAAAA"));
    }

    #[test]
    fn test_chunked_sort_matches_in_memory_sort() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let in_memory = dir.path().join("mem.fastq.gz");
        let chunked = dir.path().join("chunked.fastq.gz");

        pool_and_sort(&files, &in_memory).unwrap();
        pool_and_sort_chunked(&files, &chunked, 2).unwrap();

        assert_eq!(fs::read(&chunked).unwrap(), fs::read(&in_memory).unwrap());
        assert!(!dir.path().join(".chunked.fastq.gz.sort").exists());
    }

    #[test]
    fn test_chunked_sort_independent_of_lane_order() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let forward = dir.path().join("forward.fastq");
        let reverse = dir.path().join("reverse.fastq");
        let reversed: Vec<PathBuf> = files.iter().rev().cloned().collect();

        pool_and_sort_chunked(&files, &forward, 1).unwrap();
        pool_and_sort_chunked(&reversed, &reverse, 3).unwrap();

        assert_eq!(fs::read(&forward).unwrap(), fs::read(&reverse).unwrap());
    }

    #[test]
    fn test_single_input_is_linked() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let pooled = dir.path().join("pooled.fastq.gz");
        let linked = dir.path().join("linked.fastq.gz");

        pool_and_sort(&files[..1], &pooled).unwrap();
        link_raw(&files[0], &linked).unwrap();

        assert_eq!(fs::read(&pooled).unwrap(), fs::read(&files[0]).unwrap());
        assert_eq!(fs::read(&pooled).unwrap(), fs::read(&linked).unwrap());
        #[cfg(unix)]
        assert!(fs::symlink_metadata(&pooled).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_link_replaces_existing() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("raw.fq");
        let dest = dir.path().join("00_raw/S1_R1.fastq.gz");
        fs::write(&source, "@r\nA\n+\nI\n").unwrap();
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "stale").unwrap();

        link_raw(&source, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "@r\nA\n+\nI\n");
    }

    #[test]
    fn test_truncated_record_rejected() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.fq");
        fs::write(&bad, "@r1\nACGT\n+\nIIII\n@r2\nACGT\n").unwrap();

        let err = read_records(&bad).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_missing_header_marker_rejected() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.fq");
        fs::write(&bad, "r1\nACGT\n+\nIIII\n").unwrap();
        assert!(read_records(&bad).is_err());
    }

    #[test]
    fn test_plain_output_without_gz_extension() {
        let dir = tempdir().unwrap();
        let files = lanes(dir.path());
        let dest = dir.path().join("pooled.fastq");
        pool_and_sort(&files, &dest).unwrap();
        assert!(fs::read_to_string(&dest).unwrap().starts_with("@read1"));
    }
}
