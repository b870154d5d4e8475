//! Batch script generation.
//!
//! The input command file is split into groups of `line_unit` lines; each
//! group becomes one executable wrapper script under `<input>.shell/`. The
//! wrapper chains every command with `&&` so any failure suppresses the final
//! sentinel write, and the sentinel (`<script>.sign`) is only produced by a
//! fully successful pass.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ledger::{Backend, Ledger};

/// Result of batch generation.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Directory holding the generated scripts (`<input>.shell`).
    pub script_dir: PathBuf,
    /// Input file base name without extension.
    pub module: String,
    /// Number of batches in the ledger after generation.
    pub total: usize,
}

/// Base name of `path` without its final extension.
pub fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Split `infile` into wrapper scripts and register a Pending row per new
/// batch. Existing rows are left untouched so a rerun resumes instead of
/// restarting; the backend column is refreshed on every unfinished row.
pub async fn generate_batches(
    ledger: &Ledger,
    infile: &Path,
    line_unit: usize,
    backend: Backend,
) -> Result<BatchPlan> {
    let infile = infile
        .canonicalize()
        .with_context(|| format!("input file not found: {}", infile.display()))?;
    let module = module_name(&infile);

    let script_dir = PathBuf::from(format!("{}.shell", infile.display()));
    fs::create_dir_all(&script_dir)
        .with_context(|| format!("failed to create {}", script_dir.display()))?;

    let content = fs::read_to_string(&infile)
        .with_context(|| format!("failed to read {}", infile.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    let line_unit = line_unit.max(1);

    let mut total = 0usize;
    for (group_idx, group) in lines.chunks(line_unit).enumerate() {
        let batch = (group_idx + 1) as i64;
        total += 1;

        if ledger.has_batch(batch).await? {
            continue;
        }

        let script_path = script_dir.join(format!("{module}_{batch:04}.sh"));
        write_wrapper_script(&script_path, group)?;
        ledger
            .register_batch(batch, &script_path.display().to_string(), backend)
            .await?;
    }

    ledger.update_backend_for_unfinished(backend).await?;

    Ok(BatchPlan {
        script_dir,
        module,
        total,
    })
}

fn write_wrapper_script(script_path: &Path, commands: &[&str]) -> Result<()> {
    let joined = commands
        .iter()
        .map(|c| c.trim_end())
        .collect::<Vec<_>>()
        .join(" && \\\n");

    let content = format!(
        "#!/bin/bash\n\
         echo ========== start at : `date +%Y/%m/%d %H:%M:%S` ==========\n\
         {joined} && \\\n\
         echo ========== end at : `date +%Y/%m/%d %H:%M:%S` ========== && \\\n\
         echo LLAP 1>&2 && \\\n\
         echo LLAP > {sign}\n",
        sign = format!("{}.sign", script_path.display()),
    );

    fs::write(script_path, content)
        .with_context(|| format!("failed to write {}", script_path.display()))?;
    let mut perms = fs::metadata(script_path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(script_path, perms)
        .with_context(|| format!("failed to chmod {}", script_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir, lines: &str) -> (Ledger, PathBuf) {
        let infile = dir.path().join("work.sh");
        fs::write(&infile, lines).unwrap();
        let ledger = Ledger::open(&dir.path().join("work.sh.db")).await.unwrap();
        (ledger, infile)
    }

    #[tokio::test]
    async fn partitions_into_ceil_groups() {
        let dir = TempDir::new().unwrap();
        let (ledger, infile) = setup(&dir, "echo a\necho b\necho c\necho d\necho e\n").await;

        let plan = generate_batches(&ledger, &infile, 2, Backend::Local).await.unwrap();
        assert_eq!(plan.total, 3); // ceil(5/2)
        assert_eq!(plan.module, "work");
        assert_eq!(ledger.unfinished_indices().await.unwrap(), vec![1, 2, 3]);

        // Trailing partial group materializes as a script of its own.
        let last = plan.script_dir.join("work_0003.sh");
        let text = fs::read_to_string(&last).unwrap();
        assert!(text.contains("echo e"));
    }

    #[tokio::test]
    async fn wrapper_chains_commands_and_writes_sentinel() {
        let dir = TempDir::new().unwrap();
        let (ledger, infile) = setup(&dir, "echo a\necho b\n").await;

        let plan = generate_batches(&ledger, &infile, 2, Backend::Local).await.unwrap();
        let script = plan.script_dir.join("work_0001.sh");
        let text = fs::read_to_string(&script).unwrap();

        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains("echo a && \\\necho b && \\\n"));
        assert!(text.contains(&format!("echo LLAP > {}.sign", script.display())));

        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    #[tokio::test]
    async fn regeneration_preserves_existing_rows_and_scripts() {
        let dir = TempDir::new().unwrap();
        let (ledger, infile) = setup(&dir, "echo a\necho b\n").await;

        let plan = generate_batches(&ledger, &infile, 1, Backend::Local).await.unwrap();
        assert_eq!(plan.total, 2);
        ledger.record_finished(1, 0, None).await.unwrap();
        let script = plan.script_dir.join("work_0001.sh");
        fs::write(&script, "#!/bin/bash\n# edited\n").unwrap();

        let plan = generate_batches(&ledger, &infile, 1, Backend::QsubSge).await.unwrap();
        assert_eq!(plan.total, 2);
        // Finished row untouched, its script not regenerated.
        let row = ledger.row(1).await.unwrap();
        assert_eq!(row.state, "Finished");
        assert_eq!(row.backend, "local");
        assert!(fs::read_to_string(&script).unwrap().contains("# edited"));
        // Unfinished rows pick up the new backend.
        let row = ledger.row(2).await.unwrap();
        assert_eq!(row.backend, "qsubsge");
    }

    #[tokio::test]
    async fn final_unterminated_line_is_kept() {
        let dir = TempDir::new().unwrap();
        let (ledger, infile) = setup(&dir, "echo a\necho b").await;
        let plan = generate_batches(&ledger, &infile, 1, Backend::Local).await.unwrap();
        assert_eq!(plan.total, 2);
        let _ = ledger; // rows registered for both batches
    }
}
