//! Running libFuzzer targets as child processes.

use crate::args::{
    ARTIFACT_PREFIX_FLAGNAME, CLEANSE_CRASH_FLAGNAME, EXACT_ARTIFACT_PATH_FLAGNAME,
    FuzzerArguments, MAX_TOTAL_TIME_FLAGNAME, MERGE_CONTROL_FILE_FLAGNAME, MERGE_FLAGNAME,
    MINIMIZE_CRASH_FLAGNAME,
};
use crate::config::RunnerSettings;
use crate::error::{EngineError, EngineResult};
use crate::stats::{self, Stats};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one target process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub command: Vec<String>,
    /// Combined stdout and stderr.
    pub output: String,
    /// Exit code, or the negated signal number for signal-terminated processes.
    pub return_code: i32,
    pub time_executed: Duration,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FuzzRequest<'a> {
    pub corpus_dirs: &'a [PathBuf],
    pub timeout: Duration,
    pub arguments: &'a [String],
    pub artifact_prefix: &'a Path,
    pub extra_env: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    /// Output directory first, then the input directories.
    pub dirs: &'a [PathBuf],
    pub timeout: Duration,
    pub tmp_dir: &'a Path,
    pub arguments: &'a [String],
    pub artifact_prefix: Option<&'a Path>,
    pub merge_control_file: Option<&'a Path>,
}

/// Executes a fuzz target in its different modes.
///
/// Implementations enforce `timeout` at the process level and report an
/// overrun through [`RunResult::timed_out`]; only failing to start the process
/// at all is an `Err`.
pub trait Runner: Send + Sync {
    /// Runs the target in fuzzing mode.
    ///
    /// # Arguments
    /// * `target_path`: The fuzz target binary.
    /// * `request`: Corpus directories (the first one receives new units),
    ///   the fuzzing budget, arguments, artifact prefix and extra environment.
    ///
    /// # Returns
    /// The finished or killed process. Crashes show up in its output and
    /// return code.
    fn fuzz(&self, target_path: &Path, request: &FuzzRequest<'_>) -> EngineResult<RunResult>;

    /// Runs a corpus merge of `request.dirs[1..]` into `request.dirs[0]`.
    ///
    /// # Arguments
    /// * `target_path`: The fuzz target binary.
    /// * `request`: Merge directories, budget, a scratch `TMPDIR`, and the
    ///   optional merge control file shared by the steps of a two-step merge.
    ///
    /// # Returns
    /// The merge process result; its output carries the `MERGE-OUTER` summary.
    fn merge(&self, target_path: &Path, request: &MergeRequest<'_>) -> EngineResult<RunResult>;

    /// Runs the target once on `input_path`.
    ///
    /// # Arguments
    /// * `target_path`: The fuzz target binary.
    /// * `input_path`: The testcase to replay.
    /// * `timeout`: Process-level budget; the process is killed past it.
    /// * `arguments`: Extra libFuzzer flags, e.g. `-runs=100`.
    ///
    /// # Returns
    /// The process result, with `timed_out` set if the budget ran out.
    fn run_single_testcase(
        &self,
        target_path: &Path,
        input_path: &Path,
        timeout: Duration,
        arguments: &[String],
    ) -> EngineResult<RunResult>;

    /// Shrinks a crashing input, writing the result to `output_path`.
    ///
    /// # Arguments
    /// * `input_path`: The crashing testcase.
    /// * `output_path`: Where libFuzzer writes the minimized testcase.
    /// * `timeout`: Minimization budget.
    /// * `artifact_prefix`: Directory for intermediate artifacts.
    /// * `arguments`: Extra libFuzzer flags.
    ///
    /// # Returns
    /// The process result.
    fn minimize_crash(
        &self,
        target_path: &Path,
        input_path: &Path,
        output_path: &Path,
        timeout: Duration,
        artifact_prefix: &Path,
        arguments: &[String],
    ) -> EngineResult<RunResult>;

    /// Replaces bytes of a crashing input that are irrelevant to the crash.
    /// Takes the same arguments as [`Runner::minimize_crash`].
    fn cleanse_crash(
        &self,
        target_path: &Path,
        input_path: &Path,
        output_path: &Path,
        timeout: Duration,
        artifact_prefix: &Path,
        arguments: &[String],
    ) -> EngineResult<RunResult>;

    /// The crash artifact path reported in the output, if any.
    fn get_testcase_path(&self, log_lines: &[String]) -> Option<PathBuf> {
        stats::get_testcase_path(log_lines)
    }

    /// Statistics of a fuzzing run, parsed from its output.
    fn parse_log_stats(&self, log_lines: &[String]) -> Stats {
        stats::parse_log_stats(log_lines)
    }
}

/// Runs libFuzzer targets as child processes.
#[derive(Debug, Clone, Default)]
pub struct LibFuzzerRunner {
    settings: RunnerSettings,
}

impl LibFuzzerRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self { settings }
    }

    fn hard_timeout(&self, timeout: Duration) -> Duration {
        timeout.saturating_add(self.settings.hard_timeout_grace())
    }

    fn build_command(
        target_path: &Path,
        arguments: &FuzzerArguments,
        positional: &[&Path],
    ) -> Vec<String> {
        let mut command = vec![target_path.to_string_lossy().into_owned()];
        command.extend(arguments.to_list());
        command.extend(positional.iter().map(|p| p.to_string_lossy().into_owned()));
        command
    }

    fn execute(
        &self,
        command: Vec<String>,
        extra_env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> EngineResult<RunResult> {
        let Some((program, args)) = command.split_first() else {
            return Err(EngineError::Engine("empty command".to_string()));
        };

        // A file instead of pipes: libFuzzer can log far more than a pipe buffers.
        let mut output_file = tempfile::tempfile()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output_file.try_clone()?))
            .stderr(Stdio::from(output_file.try_clone()?));
        if let Some(cwd) = &self.settings.working_dir {
            cmd.current_dir(cwd);
        }

        tracing::debug!(?command, ?timeout, "running target");
        let start_time = Instant::now();
        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            command: command.clone(),
            source,
        })?;
        let (status, timed_out) = wait_with_timeout(&mut child, timeout)?;
        let time_executed = start_time.elapsed();

        Ok(RunResult {
            output: read_output(&mut output_file)?,
            command,
            return_code: return_code(status),
            time_executed,
            timed_out,
        })
    }
}

/// The parts of a child process the timeout loop needs.
trait Process {
    fn id(&self) -> u32;
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

impl Process for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        Child::wait(self)
    }
}

fn wait_with_timeout<P: Process>(
    child: &mut P,
    timeout: Duration,
) -> EngineResult<(ExitStatus, bool)> {
    let start_time = Instant::now();

    loop {
        let polled = match child.try_wait() {
            Ok(polled) => polled,
            Err(e) => {
                // The process must not outlive its budget just because polling failed.
                tracing::warn!(pid = child.id(), error = %e, "polling target failed, killing");
                reap(child);
                return Err(e.into());
            }
        };
        if let Some(status) = polled {
            return Ok((status, false));
        }
        if start_time.elapsed() > timeout {
            tracing::warn!(pid = child.id(), ?timeout, "target timed out, killing");
            // The child may exit between try_wait and kill.
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "kill after timeout failed");
            }
            let status = child.wait()?;
            return Ok((status, true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn reap<P: Process>(child: &mut P) {
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "kill failed");
    }
    if let Err(e) = child.wait() {
        tracing::debug!(error = %e, "wait after kill failed");
    }
}

fn return_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

fn read_output(file: &mut File) -> EngineResult<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn artifact_prefix_value(dir: &Path) -> String {
    // libFuzzer concatenates the prefix and the artifact name verbatim.
    let mut prefix = dir.to_string_lossy().into_owned();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

fn whole_seconds(duration: Duration) -> u64 {
    duration.as_secs().max(1)
}

impl Runner for LibFuzzerRunner {
    fn fuzz(&self, target_path: &Path, request: &FuzzRequest<'_>) -> EngineResult<RunResult> {
        let mut arguments = FuzzerArguments::from_list(request.arguments);
        arguments.set(
            ARTIFACT_PREFIX_FLAGNAME,
            artifact_prefix_value(request.artifact_prefix),
        );
        arguments.set(MAX_TOTAL_TIME_FLAGNAME, whole_seconds(request.timeout));
        let dirs: Vec<&Path> = request.corpus_dirs.iter().map(PathBuf::as_path).collect();
        let command = Self::build_command(target_path, &arguments, &dirs);
        self.execute(
            command,
            request.extra_env,
            self.hard_timeout(request.timeout),
        )
    }

    fn merge(&self, target_path: &Path, request: &MergeRequest<'_>) -> EngineResult<RunResult> {
        let mut arguments = FuzzerArguments::from_list(request.arguments);
        arguments.set(MERGE_FLAGNAME, 1);
        if let Some(mcf) = request.merge_control_file {
            arguments.set(MERGE_CONTROL_FILE_FLAGNAME, mcf.to_string_lossy());
        }
        if let Some(prefix) = request.artifact_prefix {
            arguments.set(ARTIFACT_PREFIX_FLAGNAME, artifact_prefix_value(prefix));
        }
        let dirs: Vec<&Path> = request.dirs.iter().map(PathBuf::as_path).collect();
        let command = Self::build_command(target_path, &arguments, &dirs);

        let mut env = BTreeMap::new();
        env.insert(
            "TMPDIR".to_string(),
            request.tmp_dir.to_string_lossy().into_owned(),
        );
        self.execute(command, &env, request.timeout)
    }

    fn run_single_testcase(
        &self,
        target_path: &Path,
        input_path: &Path,
        timeout: Duration,
        arguments: &[String],
    ) -> EngineResult<RunResult> {
        let arguments = FuzzerArguments::from_list(arguments);
        let command = Self::build_command(target_path, &arguments, &[input_path]);
        self.execute(command, &BTreeMap::new(), timeout)
    }

    fn minimize_crash(
        &self,
        target_path: &Path,
        input_path: &Path,
        output_path: &Path,
        timeout: Duration,
        artifact_prefix: &Path,
        arguments: &[String],
    ) -> EngineResult<RunResult> {
        let mut arguments = FuzzerArguments::from_list(arguments);
        arguments.set(MINIMIZE_CRASH_FLAGNAME, 1);
        arguments.set(EXACT_ARTIFACT_PATH_FLAGNAME, output_path.to_string_lossy());
        arguments.set(MAX_TOTAL_TIME_FLAGNAME, whole_seconds(timeout));
        arguments.set(ARTIFACT_PREFIX_FLAGNAME, artifact_prefix_value(artifact_prefix));
        let command = Self::build_command(target_path, &arguments, &[input_path]);
        self.execute(command, &BTreeMap::new(), self.hard_timeout(timeout))
    }

    fn cleanse_crash(
        &self,
        target_path: &Path,
        input_path: &Path,
        output_path: &Path,
        timeout: Duration,
        artifact_prefix: &Path,
        arguments: &[String],
    ) -> EngineResult<RunResult> {
        let mut arguments = FuzzerArguments::from_list(arguments);
        arguments.set(CLEANSE_CRASH_FLAGNAME, 1);
        arguments.set(EXACT_ARTIFACT_PATH_FLAGNAME, output_path.to_string_lossy());
        arguments.set(MAX_TOTAL_TIME_FLAGNAME, whole_seconds(timeout));
        arguments.set(ARTIFACT_PREFIX_FLAGNAME, artifact_prefix_value(artifact_prefix));
        let command = Self::build_command(target_path, &arguments, &[input_path]);
        self.execute(command, &BTreeMap::new(), self.hard_timeout(timeout))
    }
}

#[cfg(all(test, unix))]
mod libfuzzer_runner_tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn runner() -> LibFuzzerRunner {
        LibFuzzerRunner::new(RunnerSettings {
            hard_timeout_grace_secs: 0,
            working_dir: None,
        })
    }

    #[test]
    fn fuzz_passes_budget_prefix_and_corpus_dirs() {
        let dir = tempdir().unwrap();
        let target = write_script(dir.path(), "echo_target", "echo \"$@\"; echo \"env=$FUZZ_MODE\"; exit 3");
        let corpus = vec![dir.path().join("new"), dir.path().join("corpus")];
        let mut env = BTreeMap::new();
        env.insert("FUZZ_MODE".to_string(), "fast".to_string());
        let args = vec!["-timeout=25".to_string()];

        let result = runner()
            .fuzz(
                &target,
                &FuzzRequest {
                    corpus_dirs: &corpus,
                    timeout: Duration::from_secs(30),
                    arguments: &args,
                    artifact_prefix: dir.path(),
                    extra_env: &env,
                },
            )
            .unwrap();

        assert_eq!(result.return_code, 3);
        assert!(!result.timed_out);
        assert!(result.output.contains("-timeout=25"));
        assert!(result.output.contains("-max_total_time=30"));
        assert!(result.output.contains(&format!("-artifact_prefix={}/", dir.path().display())));
        assert!(result.output.contains(&corpus[0].display().to_string()));
        assert!(result.output.contains("env=fast"));
        assert_eq!(result.command[0], target.display().to_string());
    }

    #[test]
    fn merge_sets_control_file_and_tmpdir() {
        let dir = tempdir().unwrap();
        let target = write_script(dir.path(), "merge_target", "echo \"$@\"; echo \"tmp=$TMPDIR\"");
        let dirs = vec![dir.path().join("out"), dir.path().join("in")];
        let mcf = dir.path().join("MCF");
        let tmp = dir.path().join("merge-wd");

        let result = runner()
            .merge(
                &target,
                &MergeRequest {
                    dirs: &dirs,
                    timeout: Duration::from_secs(10),
                    tmp_dir: &tmp,
                    arguments: &[],
                    artifact_prefix: None,
                    merge_control_file: Some(&mcf),
                },
            )
            .unwrap();

        assert_eq!(result.return_code, 0);
        assert!(result.output.contains("-merge=1"));
        assert!(result.output.contains(&format!("-merge_control_file={}", mcf.display())));
        assert!(result.output.contains(&format!("tmp={}", tmp.display())));
        assert!(!result.output.contains("artifact_prefix"));
    }

    #[test]
    fn slow_target_is_killed_and_flagged() {
        let dir = tempdir().unwrap();
        let target = write_script(dir.path(), "slow_target", "sleep 5");
        let result = runner()
            .run_single_testcase(
                &target,
                &dir.path().join("input"),
                Duration::from_millis(200),
                &[],
            )
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.return_code, -9);
        assert!(result.time_executed < Duration::from_secs(5));
    }

    #[test]
    fn minimize_uses_exact_artifact_path() {
        let dir = tempdir().unwrap();
        let target = write_script(dir.path(), "min_target", "echo \"$@\"");
        let output = dir.path().join("min-output");
        let result = runner()
            .minimize_crash(
                &target,
                &dir.path().join("crash"),
                &output,
                Duration::from_secs(5),
                dir.path(),
                &["-runs=100".to_string()],
            )
            .unwrap();
        assert!(result.output.contains("-minimize_crash=1"));
        assert!(result.output.contains(&format!("-exact_artifact_path={}", output.display())));
        assert!(result.output.contains("-max_total_time=5"));
    }

    /// A process whose status cannot be polled.
    #[derive(Default)]
    struct UnpollableProcess {
        killed: bool,
        waited: bool,
    }

    impl Process for UnpollableProcess {
        fn id(&self) -> u32 {
            42
        }

        fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
            Err(std::io::Error::other("poll failed"))
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.killed = true;
            Ok(())
        }

        fn wait(&mut self) -> std::io::Result<ExitStatus> {
            use std::os::unix::process::ExitStatusExt;
            self.waited = true;
            Ok(ExitStatus::from_raw(9))
        }
    }

    #[test]
    fn failed_poll_kills_and_reaps_the_target() {
        let mut process = UnpollableProcess::default();
        let err = wait_with_timeout(&mut process, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(process.killed);
        assert!(process.waited);
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = runner()
            .run_single_testcase(
                Path::new("./this_target_does_not_exist_12345"),
                Path::new("input"),
                Duration::from_secs(1),
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One recorded call into a [`ScriptedRunner`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum Invocation {
        Fuzz {
            corpus_dirs: Vec<PathBuf>,
            arguments: Vec<String>,
            extra_env: BTreeMap<String, String>,
            timeout: Duration,
        },
        Merge {
            dirs: Vec<PathBuf>,
            arguments: Vec<String>,
            timeout: Duration,
            merge_control_file: Option<PathBuf>,
        },
        SingleTestcase {
            input_path: PathBuf,
            arguments: Vec<String>,
            timeout: Duration,
        },
        MinimizeCrash {
            input_path: PathBuf,
            output_path: PathBuf,
            arguments: Vec<String>,
        },
        CleanseCrash {
            input_path: PathBuf,
            output_path: PathBuf,
            arguments: Vec<String>,
        },
    }

    type DirsHook = Box<dyn Fn(&[PathBuf]) + Send + Sync>;

    /// A runner that replays queued results and records every call.
    #[derive(Default)]
    pub struct ScriptedRunner {
        results: Mutex<VecDeque<RunResult>>,
        invocations: Mutex<Vec<Invocation>>,
        on_fuzz: Option<DirsHook>,
        on_merge: Option<DirsHook>,
    }

    impl ScriptedRunner {
        pub fn new(results: Vec<RunResult>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                ..Self::default()
            }
        }

        /// Called with the fuzz corpus dirs, e.g. to drop new units into the first one.
        pub fn on_fuzz(mut self, hook: impl Fn(&[PathBuf]) + Send + Sync + 'static) -> Self {
            self.on_fuzz = Some(Box::new(hook));
            self
        }

        /// Called with the merge dirs; the output dir comes first.
        pub fn on_merge(mut self, hook: impl Fn(&[PathBuf]) + Send + Sync + 'static) -> Self {
            self.on_merge = Some(Box::new(hook));
            self
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.invocations.lock().unwrap().clone()
        }

        pub fn merge_invocations(&self) -> Vec<Invocation> {
            self.invocations()
                .into_iter()
                .filter(|i| matches!(i, Invocation::Merge { .. }))
                .collect()
        }

        fn next(&self, invocation: Invocation) -> EngineResult<RunResult> {
            self.invocations.lock().unwrap().push(invocation);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| EngineError::Engine("no scripted result left".to_string()))
        }
    }

    pub fn run_result(output: &str, return_code: i32, secs: u64) -> RunResult {
        RunResult {
            command: vec!["target".to_string()],
            output: output.to_string(),
            return_code,
            time_executed: Duration::from_secs(secs),
            timed_out: false,
        }
    }

    pub fn merge_output(features: i64, edges: i64) -> String {
        format!(
            "MERGE-OUTER: 2 files, 2 in the initial corpus\n\
             MERGE-OUTER: 1 new files with {features} new features added; {edges} new coverage edges\n"
        )
    }

    impl Runner for ScriptedRunner {
        fn fuzz(&self, _target_path: &Path, request: &FuzzRequest<'_>) -> EngineResult<RunResult> {
            if let Some(hook) = &self.on_fuzz {
                hook(request.corpus_dirs);
            }
            self.next(Invocation::Fuzz {
                corpus_dirs: request.corpus_dirs.to_vec(),
                arguments: request.arguments.to_vec(),
                extra_env: request.extra_env.clone(),
                timeout: request.timeout,
            })
        }

        fn merge(&self, _target_path: &Path, request: &MergeRequest<'_>) -> EngineResult<RunResult> {
            if let Some(hook) = &self.on_merge {
                hook(request.dirs);
            }
            self.next(Invocation::Merge {
                dirs: request.dirs.to_vec(),
                arguments: request.arguments.to_vec(),
                timeout: request.timeout,
                merge_control_file: request.merge_control_file.map(Path::to_path_buf),
            })
        }

        fn run_single_testcase(
            &self,
            _target_path: &Path,
            input_path: &Path,
            timeout: Duration,
            arguments: &[String],
        ) -> EngineResult<RunResult> {
            self.next(Invocation::SingleTestcase {
                input_path: input_path.to_path_buf(),
                arguments: arguments.to_vec(),
                timeout,
            })
        }

        fn minimize_crash(
            &self,
            _target_path: &Path,
            input_path: &Path,
            output_path: &Path,
            _timeout: Duration,
            _artifact_prefix: &Path,
            arguments: &[String],
        ) -> EngineResult<RunResult> {
            self.next(Invocation::MinimizeCrash {
                input_path: input_path.to_path_buf(),
                output_path: output_path.to_path_buf(),
                arguments: arguments.to_vec(),
            })
        }

        fn cleanse_crash(
            &self,
            _target_path: &Path,
            input_path: &Path,
            output_path: &Path,
            _timeout: Duration,
            _artifact_prefix: &Path,
            arguments: &[String],
        ) -> EngineResult<RunResult> {
            self.next(Invocation::CleanseCrash {
                input_path: input_path.to_path_buf(),
                output_path: output_path.to_path_buf(),
                arguments: arguments.to_vec(),
            })
        }
    }
}
