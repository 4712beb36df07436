//! Query Runner: executes compiled query scripts in a child interpreter and
//! folds the dataset they produce into the catalog.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use super::compile::compile_query_script;
use super::sentinel::{last_record, split_output};
use crate::catalog::{Catalog, DATASET_INTERNAL_ERROR_MESSAGE};
use crate::config::QueryConfig;
use crate::errors::{CatalogError, CatalogResult};
use crate::models::{DatasetRecord, DatasetStatus, DatasetVersion};
use crate::store::database::DatasetUpdate;

/// The script's last statement did not evaluate to a dataset query.
pub const EXIT_LAST_STATEMENT_INVALID: i32 = 10;
/// The script stopped itself on user request.
pub const EXIT_CANCELED: i32 = 11;
/// Environment variable naming the file result records are appended to.
pub const RESULT_FILE_ENV: &str = "DQL_RESULT_FILE";

/// What a successful run reported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub dataset_name: Option<String>,
    /// Merged stdout/stderr with result records removed.
    pub output: String,
}

/// Dataset a query produced or updated.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Dataset(DatasetRecord),
    Version(DatasetVersion),
}

#[derive(Clone, Debug)]
pub struct QueryRunner {
    interpreter: String,
    result_hook: String,
}

impl QueryRunner {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            result_hook: config.result_hook.clone(),
        }
    }

    pub fn compile(&self, script: &str) -> CatalogResult<String> {
        compile_query_script(script, &self.result_hook)
    }

    /// Run `compiled` as `<interpreter> -c <compiled>` and map its exit code.
    ///
    /// `env` entries are added on top of the inherited environment. Result
    /// records are read from the result file first, then from output lines.
    pub fn execute(
        &self,
        compiled: &str,
        env: Option<&HashMap<String, String>>,
    ) -> CatalogResult<ScriptOutcome> {
        let result_file = tempfile::NamedTempFile::new()?;
        let (mut reader, writer) = std::io::pipe()?;

        let mut command = Command::new(&self.interpreter);
        command
            .arg("-c")
            .arg(compiled)
            .env(RESULT_FILE_ENV, result_file.path())
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        if let Some(env) = env {
            command.envs(env);
        }
        let mut child = command.spawn().map_err(|e| CatalogError::QueryScriptRun {
            message: format!("Failed to start {}: {e}", self.interpreter),
            return_code: None,
            output: String::new(),
        })?;
        // The command keeps write ends open; drop them so the read sees EOF.
        drop(command);

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        let status = child.wait()?;

        let (output_name, output) = split_output(&String::from_utf8_lossy(&raw));
        let file_name = last_record(&std::fs::read_to_string(result_file.path())?);
        let return_code = status.code();
        info!(interpreter = %self.interpreter, return_code = ?return_code, "query script finished");

        match return_code {
            Some(0) => Ok(ScriptOutcome {
                dataset_name: file_name.or(output_name),
                output,
            }),
            Some(EXIT_CANCELED) => Err(CatalogError::QueryScriptCancel {
                return_code: EXIT_CANCELED,
                output,
            }),
            Some(EXIT_LAST_STATEMENT_INVALID) => Err(CatalogError::QueryScriptRun {
                message: "Last line in a script was not an instance of DatasetQuery".to_string(),
                return_code,
                output,
            }),
            Some(code) => Err(CatalogError::QueryScriptRun {
                message: format!("Query script exited with error code {code}"),
                return_code,
                output,
            }),
            None => Err(CatalogError::QueryScriptRun {
                message: "Query script was terminated by a signal".to_string(),
                return_code,
                output,
            }),
        }
    }
}

impl Catalog {
    /// Compile and run a query script.
    ///
    /// Without `target` the produced dataset records the script and its
    /// output. With `target` the script is stored on the target (a shadow
    /// dataset, created when missing) before compiling; the produced rows are
    /// then merged into it and a produced shadow is removed. A script that
    /// fails to compile or run leaves the target FAILED.
    pub fn query(
        &self,
        script: &str,
        env: Option<&HashMap<String, String>>,
        target: Option<&str>,
    ) -> CatalogResult<QueryResult> {
        let runner = QueryRunner::new(&self.config.query);
        let Some(target) = target else {
            let compiled = runner.compile(script)?;
            return self.run_query(&runner, script, &compiled, env, None);
        };
        self.prepare_query_target(target, script)?;
        let compiled = match runner.compile(script) {
            Ok(compiled) => compiled,
            Err(e) => {
                self.mark_query_failed(target, &e)?;
                return Err(e);
            }
        };
        self.execute_into_target(&runner, &compiled, env, target)
    }

    pub(crate) fn run_query(
        &self,
        runner: &QueryRunner,
        script: &str,
        compiled: &str,
        env: Option<&HashMap<String, String>>,
        target: Option<&str>,
    ) -> CatalogResult<QueryResult> {
        let Some(target) = target else {
            let outcome = runner.execute(compiled, env)?;
            let produced = self.produced_dataset(&outcome)?;
            return self.record_query_output(produced, script, &outcome.output);
        };
        self.prepare_query_target(target, script)?;
        self.execute_into_target(runner, compiled, env, target)
    }

    /// Resolve (or create) the target shadow and store `script` on it.
    fn prepare_query_target(&self, target: &str, script: &str) -> CatalogResult<DatasetRecord> {
        let target_ds = match self.db.find_dataset(target)? {
            Some(ds) if ds.shadow => ds,
            Some(_) => {
                return Err(CatalogError::validation(format!(
                    "Query target {target} must be a shadow dataset"
                )))
            }
            None => self.create_shadow_dataset(target, &[], "", false, false)?,
        };
        self.db.with_session(|s| {
            s.update_dataset(
                &target_ds.name,
                &DatasetUpdate {
                    query_script: Some(script.to_string()),
                    ..Default::default()
                },
            )?;
            s.get_dataset(&target_ds.name)
        })
    }

    fn execute_into_target(
        &self,
        runner: &QueryRunner,
        compiled: &str,
        env: Option<&HashMap<String, String>>,
        target: &str,
    ) -> CatalogResult<QueryResult> {
        let folded = runner.execute(compiled, env).and_then(|outcome| {
            let produced = self.produced_dataset(&outcome)?;
            self.fold_into_target(&produced, target)?;
            Ok(outcome)
        });
        match folded {
            Ok(outcome) => {
                let ds = self.update_dataset_status(
                    target,
                    DatasetStatus::Complete,
                    "",
                    "",
                    &outcome.output,
                )?;
                Ok(QueryResult::Dataset(ds))
            }
            Err(e) => {
                self.mark_query_failed(target, &e)?;
                Err(e)
            }
        }
    }

    /// Record a failed query on its target. A canceled run keeps the
    /// target's previous error fields.
    fn mark_query_failed(&self, target: &str, error: &CatalogError) -> CatalogResult<()> {
        warn!(target = %target, error = %error, "query failed");
        let output = error.output().unwrap_or_default();
        match error {
            CatalogError::QueryScriptCancel { .. } => self.db.with_session(|s| {
                s.update_dataset(
                    target,
                    &DatasetUpdate {
                        status: Some(DatasetStatus::Failed),
                        script_output: Some(output.to_string()),
                        ..Default::default()
                    },
                )
            }),
            CatalogError::QueryScriptDatasetNotFound { .. } => self
                .update_dataset_status(
                    target,
                    DatasetStatus::Failed,
                    DATASET_INTERNAL_ERROR_MESSAGE,
                    &format!("{error:?}"),
                    output,
                )
                .map(drop),
            _ => self
                .update_dataset_status(
                    target,
                    DatasetStatus::Failed,
                    &error.to_string(),
                    &format!("{error:?}"),
                    output,
                )
                .map(drop),
        }
    }

    fn produced_dataset(&self, outcome: &ScriptOutcome) -> CatalogResult<DatasetRecord> {
        let not_found = || CatalogError::QueryScriptDatasetNotFound {
            output: outcome.output.clone(),
        };
        let name = outcome.dataset_name.as_deref().ok_or_else(not_found)?;
        debug!(dataset = %name, "query produced dataset");
        self.db.find_dataset(name)?.ok_or_else(not_found)
    }

    fn fold_into_target(&self, produced: &DatasetRecord, target: &str) -> CatalogResult<()> {
        if produced.name == target {
            return Ok(());
        }
        let src_version = if produced.registered() {
            produced.latest_version()
        } else {
            None
        };
        self.merge_datasets(&produced.name, target, src_version, None)?;
        if produced.shadow {
            self.remove_dataset(&produced.name, None, false)?;
        }
        Ok(())
    }

    fn record_query_output(
        &self,
        produced: DatasetRecord,
        script: &str,
        output: &str,
    ) -> CatalogResult<QueryResult> {
        if produced.registered() {
            let ds = self.db.with_session(|s| {
                s.update_dataset(
                    &produced.name,
                    &DatasetUpdate {
                        script_output: Some(output.to_string()),
                        ..Default::default()
                    },
                )?;
                s.get_dataset(&produced.name)
            })?;
            let latest = ds
                .latest_version()
                .ok_or_else(|| CatalogError::validation(format!("Dataset {} has no versions", ds.name)))?;
            return Ok(QueryResult::Version(ds.get_version(latest)?.clone()));
        }
        let ds = self.db.with_session(|s| {
            s.update_dataset(
                &produced.name,
                &DatasetUpdate {
                    query_script: Some(script.to_string()),
                    sources: Some(String::new()),
                    ..Default::default()
                },
            )?;
            let ds = s.get_dataset(&produced.name)?;
            s.update_dataset_status(&ds, DatasetStatus::Complete, "", "", output)
        })?;
        Ok(QueryResult::Dataset(ds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;
    use crate::query::sentinel::encode_record;
    use crate::test_support::{catalog_with_config, MemoryBucket};

    fn sh() -> QueryRunner {
        QueryRunner {
            interpreter: "sh".to_string(),
            result_hook: "unused".to_string(),
        }
    }

    fn python3_available() -> bool {
        Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let bucket = MemoryBucket::new("mem://cats")
            .file("a.jpg", b"a")
            .file("b.jpg", b"b");
        let (dir, catalog) = catalog_with_config(&[bucket], CatalogConfig::default());
        catalog
            .create_shadow_dataset("produced", &["mem://cats".to_string()], "", true, true)
            .unwrap();
        (dir, catalog)
    }

    #[test]
    fn exit_codes_map_to_errors() {
        let runner = sh();
        assert!(matches!(
            runner.execute("exit 11", None),
            Err(CatalogError::QueryScriptCancel { return_code: 11, .. })
        ));
        match runner.execute("exit 10", None).unwrap_err() {
            CatalogError::QueryScriptRun { message, return_code, .. } => {
                assert_eq!(message, "Last line in a script was not an instance of DatasetQuery");
                assert_eq!(return_code, Some(10));
            }
            other => panic!("unexpected {other:?}"),
        }
        let err = runner.execute("echo out; echo err >&2; exit 3", None).unwrap_err();
        assert_eq!(err.to_string(), "Query script exited with error code 3");
        assert_eq!(err.output(), Some("out\nerr\n"));
    }

    #[test]
    fn records_from_file_and_output() {
        let runner = sh();
        let script = format!(
            "echo working\necho '{}'\necho '{}' >> \"${RESULT_FILE_ENV}\"\n",
            encode_record("from_stdout"),
            encode_record("from_file")
        );
        let outcome = runner.execute(&script, None).unwrap();
        assert_eq!(outcome.dataset_name.as_deref(), Some("from_file"));
        assert_eq!(outcome.output, "working\n");

        let outcome = runner
            .execute(&format!("echo '{}'", encode_record("only_stdout")), None)
            .unwrap();
        assert_eq!(outcome.dataset_name.as_deref(), Some("only_stdout"));
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn env_is_layered_over_inherited() {
        let env = HashMap::from([("DQL_TEST_VALUE".to_string(), "42".to_string())]);
        let outcome = sh()
            .execute("echo \"$DQL_TEST_VALUE\"; test -n \"$PATH\"", Some(&env))
            .unwrap();
        assert_eq!(outcome.output, "42\n");
    }

    #[test]
    fn query_without_target_records_script() {
        let (_dir, catalog) = catalog();
        let compiled = format!("echo working; echo '{}'", encode_record("produced"));
        let result = catalog
            .run_query(&sh(), "the script", &compiled, None, None)
            .unwrap();
        let QueryResult::Dataset(ds) = result else {
            panic!("expected a shadow dataset");
        };
        assert_eq!(ds.name, "produced");
        assert_eq!(ds.query_script, "the script");
        assert_eq!(ds.script_output, "working\n");
        assert!(ds.sources.is_empty());
        assert_eq!(ds.status, DatasetStatus::Complete);
    }

    #[test]
    fn query_into_target_merges_and_cleans_up() {
        let (_dir, catalog) = catalog();
        let compiled = format!("echo '{}'", encode_record("produced"));
        let result = catalog
            .run_query(&sh(), "script", &compiled, None, Some("acc"))
            .unwrap();
        let QueryResult::Dataset(acc) = result else {
            panic!("expected the target dataset");
        };
        assert_eq!(acc.name, "acc");
        assert_eq!(acc.status, DatasetStatus::Complete);
        assert_eq!(acc.query_script, "script");
        assert_eq!(catalog.dataset_stats("acc", None).unwrap().num_objects, 2);
        assert!(catalog.db().find_dataset("produced").unwrap().is_none());
        assert_eq!(catalog.get_dataset_dependencies("acc", None, false).unwrap().len(), 1);
    }

    #[test]
    fn failed_query_marks_target() {
        let (_dir, catalog) = catalog();
        let err = catalog
            .run_query(&sh(), "script", "echo broken; exit 3", None, Some("acc"))
            .unwrap_err();
        assert!(matches!(err, CatalogError::QueryScriptRun { return_code: Some(3), .. }));
        let acc = catalog.get_dataset("acc").unwrap();
        assert_eq!(acc.status, DatasetStatus::Failed);
        assert_eq!(acc.query_script, "script");
        assert_eq!(acc.error_message, "Query script exited with error code 3");
        assert_eq!(acc.script_output, "broken\n");
    }

    #[test]
    fn compile_error_marks_new_target() {
        let (_dir, catalog) = catalog();
        let err = catalog.query("x = 5", None, Some("acc")).unwrap_err();
        assert!(matches!(err, CatalogError::QueryScriptCompile(_)));
        let acc = catalog.get_dataset("acc").unwrap();
        assert!(acc.shadow);
        assert_eq!(acc.status, DatasetStatus::Failed);
        assert_eq!(acc.query_script, "x = 5");
        assert_eq!(acc.error_message, err.to_string());
    }

    #[test]
    fn cancel_keeps_previous_error_message() {
        let (_dir, catalog) = catalog();
        catalog.create_shadow_dataset("acc", &[], "", true, false).unwrap();
        catalog
            .update_dataset_status("acc", DatasetStatus::Failed, "earlier failure", "", "")
            .unwrap();
        let err = catalog
            .run_query(&sh(), "script", "echo stopping; exit 11", None, Some("acc"))
            .unwrap_err();
        assert!(matches!(err, CatalogError::QueryScriptCancel { .. }));
        let acc = catalog.get_dataset("acc").unwrap();
        assert_eq!(acc.status, DatasetStatus::Failed);
        assert_eq!(acc.error_message, "earlier failure");
        assert_eq!(acc.script_output, "stopping\n");
    }

    #[test]
    fn missing_dataset_marks_target_with_internal_error() {
        let (_dir, catalog) = catalog();
        let err = catalog
            .run_query(&sh(), "script", "echo nothing", None, Some("acc"))
            .unwrap_err();
        assert!(matches!(err, CatalogError::QueryScriptDatasetNotFound { .. }));
        let acc = catalog.get_dataset("acc").unwrap();
        assert_eq!(acc.status, DatasetStatus::Failed);
        assert_eq!(acc.error_message, DATASET_INTERNAL_ERROR_MESSAGE);
        assert_eq!(acc.script_output, "nothing\n");
    }

    #[test]
    fn missing_dataset_is_reported() {
        let (_dir, catalog) = catalog();
        for compiled in ["echo nothing".to_string(), format!("echo '{}'", encode_record("ghost"))] {
            let err = catalog
                .run_query(&sh(), "script", &compiled, None, None)
                .unwrap_err();
            assert!(matches!(err, CatalogError::QueryScriptDatasetNotFound { .. }));
        }
    }

    #[test]
    fn python_end_to_end() {
        if !python3_available() {
            return;
        }
        let hook_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            hook_dir.path().join("dql_test_hook.py"),
            "import os, zlib\n\
             def return_ds(name):\n    \
                 rec = '__ds__%s__ds__%08x' % (name, zlib.crc32(name.encode()))\n    \
                 with open(os.environ['DQL_RESULT_FILE'], 'a') as f:\n        \
                     f.write(rec + '\\n')\n",
        )
        .unwrap();
        let mut config = CatalogConfig::default();
        config.query.result_hook = "dql_test_hook".to_string();
        let bucket = MemoryBucket::new("mem://cats").file("a.jpg", b"a");
        let (_dir, catalog) = catalog_with_config(&[bucket], config);
        catalog
            .create_shadow_dataset("produced", &["mem://cats".to_string()], "", true, true)
            .unwrap();
        let env = HashMap::from([(
            "PYTHONPATH".to_string(),
            hook_dir.path().display().to_string(),
        )]);

        let result = catalog
            .query("print('hello')\n'produced'\n", Some(&env), None)
            .unwrap();
        let QueryResult::Dataset(ds) = result else {
            panic!("expected a shadow dataset");
        };
        assert_eq!(ds.script_output, "hello\n");

        let err = catalog.query("x = 'produced'", Some(&env), None).unwrap_err();
        assert!(matches!(err, CatalogError::QueryScriptCompile(_)));
    }
}
