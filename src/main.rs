mod interface;

use std::io::Write;
use std::process::ExitCode;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use once_cell::sync::Lazy;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use tracing::*;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rift::object::{self, Object};
use rift::{Digest, Lsn, RefName, RefUpdate, Repo, Rev, Signature};

use crate::interface::*;

static ARGS: Lazy<Opt> = Lazy::new(Opt::parse);

fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    Lazy::force(&ARGS);

    let default_level = if ARGS.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match run() {
        Ok(code) => Ok(code),
        Err(report) => match report.downcast_ref::<rift::Error>() {
            Some(error) => {
                let code = error.exit_code();
                eprintln!("Error: {report:?}");
                Ok(ExitCode::from(code))
            }
            None => Err(report),
        },
    }
}

fn repo_path() -> Result<Utf8PathBuf> {
    Ok(match ARGS.path {
        Some(ref path) => path
            .canonicalize_utf8()
            .wrap_err(format!("Directory not found: '{path}'"))?,
        None => Utf8PathBuf::try_from(std::env::current_dir()?)?.canonicalize_utf8()?,
    })
}

fn run() -> Result<ExitCode> {
    let path = repo_path()?;

    match &ARGS.command {
        Command::Init => {
            let repo = Repo::init(&path)?;
            println!("Initialised rift repository in {}", repo.dir());
            return Ok(ExitCode::SUCCESS);
        }
        Command::HashObject {
            kind,
            write: false,
            file,
        } => {
            let data = std::fs::read(file).wrap_err(format!("Cannot read '{file}'"))?;
            println!("{}", Digest::new(&object::frame(*kind, &data)));
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let repo = Repo::open(&path)?;
    let code = dispatch(&repo)?;
    repo.close();
    Ok(code)
}

fn dispatch(repo: &Repo) -> Result<ExitCode> {
    match &ARGS.command {
        Command::Init => unreachable!(),

        Command::HashObject { kind, file, .. } => {
            let data = std::fs::read(file).wrap_err(format!("Cannot read '{file}'"))?;
            println!("{}", repo.store().put_raw(*kind, &data)?);
        }

        Command::CatFile(cat) => return cat_file(repo, cat),

        Command::CommitTree {
            tree,
            parents,
            message,
        } => {
            let tree = resolve_object(repo, tree)?;
            let parents = parents
                .iter()
                .map(|p| resolve_commit(repo, p))
                .collect::<Result<Vec<_>>>()?;
            let author = Signature::from_env()
                .ok_or_else(|| eyre!("RIFT_AUTHOR_NAME and RIFT_AUTHOR_EMAIL must be set"))?;
            let commit_id = repo.write_commit(&tree, &parents, &author, message)?;
            println!("{commit_id}");
        }

        Command::UpdateRef {
            delete,
            name,
            value,
            old,
            message,
        } => {
            let name = RefName::from_str(name)?;
            let update = if *delete {
                let old = match value {
                    Some(old) => resolve_old(repo, old)?,
                    None => repo.refs().read(&name)?,
                };
                RefUpdate {
                    name,
                    old,
                    new: None,
                    message: message.clone(),
                }
            } else {
                let new = value
                    .as_deref()
                    .ok_or_else(|| eyre!("A new value is required unless deleting"))?;
                let new = resolve_commit(repo, new)?;
                let old = match old {
                    Some(old) => resolve_old(repo, old)?,
                    None => repo.refs().read(&name)?,
                };
                RefUpdate {
                    name,
                    old,
                    new: Some(new),
                    message: message.clone(),
                }
            };
            let lsn = repo.refs().apply(&update)?;
            info!(%lsn, name = %update.name, "Updated reference");
        }

        Command::ShowRef { prefix } => {
            for (name, digest) in repo.refs().list(prefix)? {
                println!("{digest} {name}");
            }
        }

        Command::Log { rev, max_count } => {
            let start = resolve_commit(repo, rev)?;
            let mut stdout = StandardStream::stdout(ColorChoice::Auto);
            for item in repo.log(&start).take(max_count.unwrap_or(usize::MAX)) {
                let (digest, commit) = item?;

                stdout.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)))?;
                write!(stdout, "commit {digest}")?;
                stdout.reset()?;
                writeln!(stdout)?;
                if commit.is_merge() {
                    let parents = commit
                        .parents()
                        .iter()
                        .map(|p| p.short())
                        .collect::<Vec<_>>();
                    writeln!(stdout, "Merge: {}", parents.join(" "))?;
                }
                let author = commit.author();
                writeln!(stdout, "Author: {} <{}>", author.name(), author.email())?;
                writeln!(
                    stdout,
                    "Date:   {}",
                    author.when().0.format("%a %b %e %H:%M:%S %Y %z")
                )?;
                writeln!(stdout)?;
                for line in commit.message().lines() {
                    writeln!(stdout, "    {line}")?;
                }
                writeln!(stdout)?;
            }
        }

        Command::MergeBase { a, b, all } => {
            let a = resolve_commit(repo, a)?;
            let b = resolve_commit(repo, b)?;
            let bases = repo.history().merge_bases(&a, &b)?;
            if bases.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
            for base in bases.iter().take(if *all { usize::MAX } else { 1 }) {
                println!("{base}");
            }
        }

        Command::IsAncestor { a, b } => {
            let a = resolve_commit(repo, a)?;
            let b = resolve_commit(repo, b)?;
            if !repo.history().is_ancestor(&a, &b)? {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Fsck => return fsck(repo),

        Command::Recover => {
            let recovery = repo.recover()?;
            for (what, lsns) in [
                ("replayed", &recovery.replayed),
                ("confirmed", &recovery.confirmed),
                ("superseded", &recovery.superseded),
            ] {
                for lsn in lsns {
                    println!("{what} {lsn}");
                }
            }
        }

        Command::CompactLog { before } => {
            repo.log_file().truncate(Lsn(*before))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cat_file(repo: &Repo, cat: &CatFile) -> Result<ExitCode> {
    match cat {
        CatFile::Exists { object } => {
            let digest = resolve_object(repo, object)?;
            match repo.store().load(&digest) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(ExitCode::FAILURE),
                Err(e) => return Err(e.into()),
            }
        }
        CatFile::PrettyPrint { object } => {
            let digest = resolve_object(repo, object)?;
            let stdout = std::io::stdout().lock();
            match repo.store().load(&digest)? {
                Object::Blob(blob) => blob.pretty_print(stdout)?,
                Object::Tree(tree) => tree.pretty_print(stdout)?,
                Object::Commit(commit) => commit.pretty_print(stdout)?,
            }
        }
        CatFile::Type { object } => {
            let digest = resolve_object(repo, object)?;
            println!("{}", repo.store().read_kind(&digest)?);
        }
        CatFile::Size { object } => {
            let digest = resolve_object(repo, object)?;
            println!("{}", repo.store().load(&digest)?.payload().len());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn fsck(repo: &Repo) -> Result<ExitCode> {
    let mut healthy = true;

    for (digest, error) in repo.store().verify_all()? {
        println!("broken object {digest}: {error}");
        healthy = false;
    }

    for (name, digest) in repo.refs().list("refs/")? {
        if let Err(error) = repo.store().get_commit(&digest) {
            println!("broken reference {name}: {error}");
            healthy = false;
        }
    }

    let pending = repo.log_file().pending(Lsn(0))?;
    if !pending.is_empty() {
        println!("{} unconfirmed reference updates, run `rift recover`", pending.len());
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(4)
    })
}

/// A commit, by revision.
fn resolve_commit(repo: &Repo, rev: &str) -> Result<Digest> {
    Rev::parse(rev)?
        .resolve(repo)?
        .ok_or_else(|| eyre!("Unknown revision '{rev}'"))
}

/// Any object, by full or abbreviated digest, or a commit by revision.
fn resolve_object(repo: &Repo, name: &str) -> Result<Digest> {
    if let Ok(digest) = Digest::from_str(name) {
        return Ok(digest);
    }
    if name.len() >= 4 && name.chars().all(|c| c.is_ascii_hexdigit()) {
        let candidates = repo.store().find_by_prefix(name)?;
        match candidates.as_slice() {
            [] => {}
            [digest] => return Ok(digest.clone()),
            _ => {
                return Err(rift::Error::AmbiguousRevision {
                    prefix: name.to_owned(),
                    candidates,
                }
                .into())
            }
        }
    }
    resolve_commit(repo, name)
}

/// An expected old value. The null digest means "unbound".
fn resolve_old(repo: &Repo, old: &str) -> Result<Option<Digest>> {
    match Digest::from_str(old) {
        Ok(digest) if digest.is_null() => Ok(None),
        Ok(digest) => Ok(Some(digest)),
        Err(_) => resolve_commit(repo, old).map(Some),
    }
}
