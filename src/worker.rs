use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::read::MultiGzDecoder;
use log::{debug, warn};
use uuid::Uuid;

use crate::gate::{sha256_file, ArtifactEntry, CompletionManifest, IdempotencyGate};
use crate::record::decode_line;
use crate::scope::{Scope, ScopeRows};
use crate::shards::ShardHandle;
use crate::sink::{commit, staging_path, ScopeSink};
use crate::transform::RecordTransform;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub lines_read: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    pub rows: BTreeMap<Scope, usize>,
}

impl ShardStats {
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    /// The gate reported the shard as already done; nothing was read.
    Skipped,
    Processed(ShardStats),
}

/// Turns one shard into per-scope artifacts.
pub struct ShardWorker<T: RecordTransform> {
    transform: T,
    gate: IdempotencyGate,
    sink: ScopeSink,
    run_id: Uuid,
}

impl<T: RecordTransform> ShardWorker<T> {
    pub fn new(transform: T, gate: IdempotencyGate, run_id: Uuid) -> Self {
        Self { transform, gate, sink: ScopeSink, run_id }
    }

    pub fn gate(&self) -> &IdempotencyGate {
        &self.gate
    }

    pub fn scopes(&self) -> &'static [Scope] {
        self.transform.scopes()
    }

    pub fn process(&self, shard: &ShardHandle) -> Result<ShardOutcome> {
        if self.gate.is_done(shard) {
            debug!("Shard already processed: {}", shard);
            return Ok(ShardOutcome::Skipped);
        }

        let (rows, mut stats) = self.extract(shard)?;
        // A forced pass may still find the previous manifest; it must not outlive the artifacts it describes.
        self.gate.clear(shard)?;
        let output_root = self.gate.output_root();
        let mut artifacts = BTreeMap::new();
        let mut rows_by_scope = rows.into_iter_scopes().collect::<BTreeMap<_, _>>();

        for &scope in self.transform.scopes() {
            let artifact = shard.artifact_path(output_root, scope);
            let Some(scope_rows) = rows_by_scope.remove(&scope) else {
                // A forced re-run must not leave rows from an earlier pass behind.
                if artifact.exists() {
                    fs::remove_file(&artifact)
                        .with_context(|| format!("Failed to remove stale artifact {}", artifact.display()))?;
                }
                continue;
            };
            let written = self.write_artifact(scope, &scope_rows, &artifact)?;
            stats.rows.insert(scope, written);
            artifacts.insert(
                scope,
                ArtifactEntry {
                    path: artifact.strip_prefix(output_root).unwrap_or(&artifact).to_path_buf(),
                    rows: written,
                    sha256: sha256_file(&artifact)?,
                },
            );
        }
        for (scope, dropped) in rows_by_scope {
            warn!("Transform emitted {} rows for undeclared scope '{}' in {}; dropped", dropped.len(), scope, shard);
        }

        let manifest = CompletionManifest {
            shard: shard.relative.clone(),
            run_id: self.run_id,
            completed_at: Utc::now(),
            lines_read: stats.lines_read,
            records_decoded: stats.records_decoded,
            decode_errors: stats.decode_errors,
            artifacts,
        };
        self.gate.mark_done(shard, &manifest)?;

        debug!(
            "Finished {}: Lines={}, Records={}, JsonErrors={}, Rows={}",
            shard,
            stats.lines_read,
            stats.records_decoded,
            stats.decode_errors,
            stats.total_rows()
        );
        Ok(ShardOutcome::Processed(stats))
    }

    /// Reads the whole shard. Bad lines are logged and skipped; I/O and decompression errors fail the shard.
    fn extract(&self, shard: &ShardHandle) -> Result<(ScopeRows, ShardStats)> {
        let file = File::open(&shard.path).with_context(|| format!("Failed to open shard: {}", shard.path.display()))?;
        let mut reader: Box<dyn BufRead> = if shard.is_compressed() {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut rows = ScopeRows::new();
        let mut stats = ShardStats::default();
        let mut buf = Vec::new();
        let mut line_num = 0u64;

        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .with_context(|| format!("Failed reading {} after line {}", shard.path.display(), line_num))?;
            if read == 0 {
                break;
            }
            line_num += 1;
            stats.lines_read += 1;

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    stats.decode_errors += 1;
                    warn!("Invalid UTF-8 in {}:{}: {}", shard, line_num, e);
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }

            match decode_line::<T::Record>(line) {
                Ok(record) => {
                    stats.records_decoded += 1;
                    rows.extend(self.transform.transform(&record));
                }
                Err(e) => {
                    stats.decode_errors += 1;
                    warn!("Error parsing JSON from {}:{}: {}", shard, line_num, e);
                }
            }
        }
        Ok((rows, stats))
    }

    fn write_artifact(&self, scope: Scope, rows: &[Vec<String>], artifact: &Path) -> Result<usize> {
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory {}", parent.display()))?;
        }
        let staging = staging_path(artifact);
        if staging.exists() {
            fs::remove_file(&staging)
                .with_context(|| format!("Failed to remove stale staging file {}", staging.display()))?;
        }
        let written = self.sink.append(scope, rows, &staging)?;
        commit(&staging, artifact)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::AuthorScopes;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_shard(root: &Path, relative: &str, lines: &[String]) -> ShardHandle {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        for line in lines {
            writeln!(encoder, "{}", line).unwrap();
        }
        encoder.finish().unwrap();
        ShardHandle::new(root, path).unwrap()
    }

    fn work_line(work_id: &str, author_id: &str) -> String {
        format!(
            r#"{{"id":"{}","publication_year":2020,"type":"article","authorships":[{{"author":{{"id":"{}","display_name":"X"}}}}]}}"#,
            work_id, author_id
        )
    }

    fn worker(out: &Path, ids: &[&str]) -> ShardWorker<AuthorScopes> {
        let transform = AuthorScopes::new(Arc::new(ids.iter().copied().collect()));
        ShardWorker::new(transform, IdempotencyGate::new(out, false), Uuid::new_v4())
    }

    #[test]
    fn malformed_lines_do_not_fail_the_shard() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let lines: Vec<String> = (0..100)
            .map(|i| if i % 33 == 5 { "{broken json".to_string() } else { work_line(&format!("W{}", i), "A1") })
            .collect();
        let shard = write_shard(corpus.path(), "updated_date=2024-01-01/part_000.gz", &lines);

        let outcome = worker(out.path(), &["A1"]).process(&shard).unwrap();
        let ShardOutcome::Processed(stats) = outcome else { panic!("expected processing") };
        assert_eq!(stats.lines_read, 100);
        assert_eq!(stats.decode_errors, 3);
        assert_eq!(stats.records_decoded, 97);
        assert_eq!(stats.rows[&Scope::Works], 97);

        let works = fs::read_to_string(shard.artifact_path(out.path(), Scope::Works)).unwrap();
        assert_eq!(works.lines().count(), 98);
    }

    #[test]
    fn second_pass_is_skipped_by_the_gate() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let shard = write_shard(corpus.path(), "part_000.gz", &[work_line("W1", "A1")]);
        let worker = worker(out.path(), &["A1"]);

        assert!(matches!(worker.process(&shard).unwrap(), ShardOutcome::Processed(_)));
        let before = fs::read(shard.artifact_path(out.path(), Scope::Works)).unwrap();
        assert_eq!(worker.process(&shard).unwrap(), ShardOutcome::Skipped);
        let after = fs::read(shard.artifact_path(out.path(), Scope::Works)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn shard_without_rows_is_still_marked_done() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let shard = write_shard(corpus.path(), "part_001.gz", &[]);
        let worker = worker(out.path(), &["A1"]);

        let ShardOutcome::Processed(stats) = worker.process(&shard).unwrap() else { panic!("expected processing") };
        assert_eq!(stats.total_rows(), 0);
        assert!(!shard.artifact_path(out.path(), Scope::Works).exists());
        assert!(worker.gate().is_done(&shard));
    }

    #[test]
    fn leftovers_from_a_crashed_run_are_replaced_not_appended() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let shard = write_shard(corpus.path(), "part_002.gz", &[work_line("W1", "A1")]);
        let artifact = shard.artifact_path(out.path(), Scope::Works);
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, "author_id,year,type,count\nA1,2020,arti").unwrap();
        fs::write(staging_path(&artifact), "garbage").unwrap();

        worker(out.path(), &["A1"]).process(&shard).unwrap();
        assert_eq!(fs::read_to_string(&artifact).unwrap(), "author_id,year,type,count\nA1,2020,article,1\n");
        assert!(!staging_path(&artifact).exists());
    }

    #[test]
    fn failed_forced_pass_leaves_the_shard_not_done() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let shard = write_shard(corpus.path(), "part_004.gz", &[work_line("W1", "A1")]);
        worker(out.path(), &["A1"]).process(&shard).unwrap();

        write_shard(corpus.path(), "part_004.gz", &[work_line("W2", "A1")]);
        // A non-empty directory where the coauthors artifact goes makes its commit fail.
        let coauthors = shard.artifact_path(out.path(), Scope::Coauthors);
        fs::remove_file(&coauthors).unwrap();
        fs::create_dir_all(coauthors.join("blocker")).unwrap();

        let forced = ShardWorker::new(
            AuthorScopes::new(Arc::new(["A1"].into_iter().collect())),
            IdempotencyGate::new(out.path(), true),
            Uuid::new_v4(),
        );
        assert!(forced.process(&shard).is_err());

        let normal = worker(out.path(), &["A1"]);
        assert!(!normal.gate().is_done(&shard));
        fs::remove_dir_all(&coauthors).unwrap();
        assert!(matches!(normal.process(&shard).unwrap(), ShardOutcome::Processed(_)));
        assert_eq!(normal.gate().verify(&shard).unwrap(), crate::gate::Verification::Intact);
    }

    #[test]
    fn corrupt_gzip_is_a_shard_failure() {
        let corpus = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let shard = write_shard(corpus.path(), "part_003.gz", &[work_line("W1", "A1")]);
        fs::write(&shard.path, b"this was never gzip data\n").unwrap();

        let worker = worker(out.path(), &["A1"]);
        assert!(worker.process(&shard).is_err());
        assert!(!worker.gate().is_done(&shard));
    }

    #[test]
    fn missing_shard_file_is_a_shard_failure() {
        let out = TempDir::new().unwrap();
        let shard = ShardHandle { path: PathBuf::from("/definitely/not/here.gz"), relative: PathBuf::from("here.gz") };
        assert!(worker(out.path(), &["A1"]).process(&shard).is_err());
    }
}
