use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;

use rift::ObjectKind;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Create an empty repository, or do nothing if one exists.
    Init,

    /// Compute the digest of a file's contents as an object, optionally storing it.
    HashObject {
        /// Kind of object to create
        #[clap(short = 't', default_value = "blob")]
        kind: ObjectKind,

        /// Actually write the object into the store
        #[clap(short = 'w')]
        write: bool,

        file: Utf8PathBuf,
    },

    #[clap(subcommand)]
    CatFile(CatFile),

    /// Create a commit object from a tree and print its digest.
    CommitTree {
        tree: String,

        /// A parent commit; may be given several times, order is kept
        #[clap(short = 'p', value_name = "parent")]
        parents: Vec<String>,

        #[clap(short, long, env = "RIFT_COMMIT_MESSAGE")]
        message: String,
    },

    /// Compare-and-swap a reference. Without `<old>`, the current value is expected.
    UpdateRef {
        /// Delete the reference; `<value>` is then the expected old value
        #[clap(short = 'd')]
        delete: bool,

        name: String,

        value: Option<String>,

        old: Option<String>,

        /// Message recorded in the transaction log
        #[clap(short, long, default_value = "")]
        message: String,
    },

    /// List references and their values.
    ShowRef {
        #[clap(default_value = "refs/")]
        prefix: String,
    },

    /// Show commit history, newest first.
    Log {
        #[clap(default_value = "HEAD")]
        rev: String,

        /// Stop after this many commits
        #[clap(short = 'n', long)]
        max_count: Option<usize>,
    },

    /// Print the best common ancestor of two commits.
    MergeBase {
        a: String,
        b: String,

        /// Print every lowest common ancestor, best first
        #[clap(long)]
        all: bool,
    },

    /// Exit successfully if `<a>` is an ancestor of `<b>`.
    IsAncestor { a: String, b: String },

    /// Verify every object and reference.
    Fsck,

    /// Replay reference updates left unconfirmed by a crash. Other writers must be stopped.
    Recover,

    /// Drop confirmed transaction log entries older than `<before>`.
    CompactLog { before: u64 },
}

#[derive(Clone, Debug, Subcommand)]
pub enum CatFile {
    /// Exit with status `ExitCode::SUCCESS` if `object` exists and is a valid object, and with
    /// `ExitCode::FAILURE` if it does not exist. If `object` is corrupt, print an error to stderr.
    #[clap(short_flag = 'e')]
    Exists {
        #[clap(value_name = "object")]
        object: String,
    },

    /// Pretty-print the contents of `object` based on its type
    #[clap(short_flag = 'p')]
    PrettyPrint {
        #[clap(value_name = "object")]
        object: String,
    },

    /// Print the type of `object` to stdout
    #[clap(short_flag = 't')]
    Type {
        #[clap(value_name = "object")]
        object: String,
    },

    /// Print the size of `object` to stdout
    #[clap(short_flag = 's')]
    Size {
        #[clap(value_name = "object")]
        object: String,
    },
}

#[derive(Debug, Parser)]
#[clap(name = "rift", version, about)]
pub struct Opt {
    #[clap(subcommand)]
    pub command: Command,

    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Run as if started in this directory.
    #[clap(short = 'C', env = "RIFT_DIR", global = true)]
    pub path: Option<Utf8PathBuf>,
}
