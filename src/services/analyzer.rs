use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Environment variables that size the implicit thread pools of common
/// numeric and ML runtimes (OpenMP, OpenBLAS, MKL, numexpr, TensorFlow,
/// Accelerate).
pub const THREAD_POOL_VARS: &[&str] = &[
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "MKL_NUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
    "TF_NUM_INTRAOP_THREADS",
    "TF_NUM_INTEROP_THREADS",
];

/// The opaque analysis step.
///
/// Implementations receive the raw uploaded bytes and return the result
/// document. They run on the blocking thread pool and must be idempotent in
/// their input: a redelivered message runs the same input again.
pub trait Analyzer: Send + Sync + 'static {
    fn analyze(&self, input: &[u8]) -> Result<Vec<u8>, AnalysisError>;
}

impl<F> Analyzer for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, AnalysisError> + Send + Sync + 'static,
{
    fn analyze(&self, input: &[u8]) -> Result<Vec<u8>, AnalysisError> {
        self(input)
    }
}

/// Pin the thread pools of numeric libraries loaded into this process.
///
/// Must run before any other thread is started (in particular before the
/// async runtime is built): the process environment is not synchronized.
pub fn pin_thread_pools(threads: usize) {
    let value = threads.max(1).to_string();
    for var in THREAD_POOL_VARS {
        std::env::set_var(var, &value);
    }
}

/// Runs an external analysis program per job.
///
/// The source bytes are piped to the program's stdin and its stdout is the
/// result document. The child runs inside the scratch directory with its
/// numeric thread pools pinned.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: PathBuf,
    args: Vec<String>,
    scratch_dir: PathBuf,
    threads: usize,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            scratch_dir: scratch_dir.into(),
            threads: 1,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.scratch_dir)
            .env("TMPDIR", &self.scratch_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let threads = self.threads.to_string();
        for var in THREAD_POOL_VARS {
            command.env(var, &threads);
        }
        command
    }
}

impl Analyzer for CommandAnalyzer {
    fn analyze(&self, input: &[u8]) -> Result<Vec<u8>, AnalysisError> {
        std::fs::create_dir_all(&self.scratch_dir).map_err(AnalysisError::Io)?;
        let mut child = self.command().spawn().map_err(AnalysisError::Spawn)?;

        let mut stdin = child.stdin.take().ok_or_else(|| AnalysisError::Failed("stdin unavailable".into()))?;
        let mut stdout = child.stdout.take().ok_or_else(|| AnalysisError::Failed("stdout unavailable".into()))?;
        let mut stderr = child.stderr.take().ok_or_else(|| AnalysisError::Failed("stderr unavailable".into()))?;

        // Feed stdin and drain stderr concurrently with stdout so a chatty
        // child cannot fill a pipe and deadlock.
        let (output, errors) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || {
                let result = stdin.write_all(input);
                drop(stdin);
                result
            });
            let err_reader = scope.spawn(move || {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).map(|_| buf)
            });
            let mut out = Vec::new();
            let read = stdout.read_to_end(&mut out).map(|_| out);
            let written = writer.join().unwrap_or_else(|_| Ok(()));
            let errors = err_reader.join().unwrap_or_else(|_| Ok(Vec::new()));
            (written.and(read), errors.unwrap_or_default())
        });

        let status = child.wait().map_err(AnalysisError::Io)?;
        if !status.success() {
            return Err(AnalysisError::Exit {
                code: status.code(),
                stderr: tail(&errors, 2048),
            });
        }
        // Exiting cleanly without reading all of stdin still leaves the input unanalyzed.
        match output {
            Ok(out) => Ok(out),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(AnalysisError::Failed(
                "analyzer closed stdin before reading the whole input".into(),
            )),
            Err(e) => Err(AnalysisError::Io(e)),
        }
    }
}

fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Failed to start analyzer: {0}")]
    Spawn(std::io::Error),

    #[error("Analyzer I/O error: {0}")]
    Io(std::io::Error),

    #[error("Analyzer exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("Analysis failed: {0}")]
    Failed(String),
}
