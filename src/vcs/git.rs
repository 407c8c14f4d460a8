//! libgit2-backed `Vcs` implementation.
//!
//! The repository handle is opened per call: `git2::Repository` is not
//! `Sync`, and every lifecycle operation is short-lived anyway.

use super::{CommitOutcome, MergeOutcome, Vcs};
use anyhow::{Context, Result, anyhow};
use git2::{BranchType, ErrorCode, Repository, Signature, StatusOptions, build::CheckoutBuilder};
use std::path::Path;

/// Committer identity for orchestrator-made commits.
const COMMIT_NAME: &str = "crucible";
const COMMIT_EMAIL: &str = "crucible@localhost";

/// Default `Vcs` backed by libgit2.
#[derive(Debug, Default, Clone)]
pub struct GitVcs;

impl GitVcs {
    fn open(cwd: &Path) -> Result<Repository> {
        Repository::discover(cwd).context("Failed to open git repository")
    }

    fn signature() -> Result<Signature<'static>> {
        Signature::now(COMMIT_NAME, COMMIT_EMAIL).context("Failed to build git signature")
    }

    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|head| head.peel_to_commit().ok())
    }

    fn write_index_tree(repo: &Repository) -> Result<git2::Oid> {
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(index.write_tree()?)
    }
}

impl Vcs for GitVcs {
    fn is_repo(&self, cwd: &Path) -> bool {
        Repository::discover(cwd).is_ok()
    }

    fn current_branch(&self, cwd: &Path) -> Result<String> {
        let repo = Self::open(cwd)?;
        let head = match repo.head() {
            Ok(head) => head,
            // Unborn branch: report the symbolic target's short name.
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                let reference = repo.find_reference("HEAD")?;
                let target = reference.symbolic_target().unwrap_or("HEAD");
                return Ok(target
                    .strip_prefix("refs/heads/")
                    .unwrap_or("HEAD")
                    .to_string());
            }
            Err(e) => return Err(e.into()),
        };
        if head.is_branch() {
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        } else {
            Ok("HEAD".to_string())
        }
    }

    fn is_clean(&self, cwd: &Path) -> Result<bool> {
        let repo = Self::open(cwd)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses.is_empty())
    }

    fn stash(&self, message: &str, cwd: &Path) -> Result<bool> {
        let mut repo = Self::open(cwd)?;
        let sig = Self::signature()?;
        match repo.stash_save(&sig, message, Some(git2::StashFlags::INCLUDE_UNTRACKED)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to stash changes"),
        }
    }

    fn stash_pop(&self, cwd: &Path) -> Result<()> {
        let mut repo = Self::open(cwd)?;
        repo.stash_pop(0, None).context("Failed to pop stash")
    }

    fn create_branch(&self, name: &str, cwd: &Path) -> Result<()> {
        let repo = Self::open(cwd)?;
        let commit =
            Self::head_commit(&repo).ok_or_else(|| anyhow!("repository has no commits yet"))?;
        repo.branch(name, &commit, false)
            .with_context(|| format!("Failed to create branch {name}"))?;
        Ok(())
    }

    fn checkout_branch(&self, name: &str, cwd: &Path) -> Result<()> {
        let repo = Self::open(cwd)?;
        let refname = format!("refs/heads/{name}");
        repo.set_head(&refname)
            .with_context(|| format!("Failed to set HEAD to {name}"))?;
        repo.checkout_head(Some(CheckoutBuilder::default().safe()))
            .with_context(|| format!("Failed to check out {name}"))?;
        Ok(())
    }

    fn merge_branch(&self, name: &str, cwd: &Path) -> Result<MergeOutcome> {
        let repo = Self::open(cwd)?;
        let branch = repo
            .find_branch(name, BranchType::Local)
            .with_context(|| format!("Branch {name} not found"))?;
        let target = branch.get().peel_to_commit()?;
        let annotated = repo.find_annotated_commit(target.id())?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::UpToDate);
        }

        if analysis.is_fast_forward() {
            let head_ref = repo.head()?;
            let refname = head_ref
                .name()
                .ok_or_else(|| anyhow!("unnamed HEAD reference"))?
                .to_string();
            let mut reference = repo.find_reference(&refname)?;
            reference.set_target(target.id(), "fast-forward merge")?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
            return Ok(MergeOutcome::FastForward);
        }

        repo.merge(&[&annotated], None, None)
            .context("Merge failed")?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            // Leave the merge state in place for resolution or abort.
            return Ok(MergeOutcome::Conflict(self.conflict_files(cwd)?));
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature()?;
        let head = Self::head_commit(&repo).ok_or_else(|| anyhow!("HEAD has no commit"))?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("merge branch {name}"),
            &tree,
            &[&head, &target],
        )?;
        repo.cleanup_state()?;
        Ok(MergeOutcome::Merged)
    }

    fn delete_branch(&self, name: &str, cwd: &Path) -> Result<()> {
        let repo = Self::open(cwd)?;
        let mut branch = repo
            .find_branch(name, BranchType::Local)
            .with_context(|| format!("Branch {name} not found"))?;
        branch
            .delete()
            .with_context(|| format!("Failed to delete branch {name}"))
    }

    fn commit_all(&self, message: &str, cwd: &Path) -> Result<CommitOutcome> {
        let repo = Self::open(cwd)?;
        let tree_id = Self::write_index_tree(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature()?;

        match Self::head_commit(&repo) {
            Some(parent) => {
                if parent.tree_id() == tree_id {
                    return Ok(CommitOutcome {
                        ok: false,
                        message: "nothing to commit".to_string(),
                    });
                }
                repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
            }
            None => {
                repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?;
            }
        }
        Ok(CommitOutcome {
            ok: true,
            message: message.to_string(),
        })
    }

    fn conflict_files(&self, cwd: &Path) -> Result<Vec<String>> {
        let repo = Self::open(cwd)?;
        let index = repo.index()?;
        let mut files = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
            if let Some(entry) = entry {
                files.push(String::from_utf8_lossy(&entry.path).to_string());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn merge_abort(&self, cwd: &Path) -> Result<()> {
        let repo = Self::open(cwd)?;
        let head = Self::head_commit(&repo).ok_or_else(|| anyhow!("HEAD has no commit"))?;
        repo.reset(
            head.as_object(),
            git2::ResetType::Hard,
            Some(CheckoutBuilder::default().force()),
        )?;
        repo.cleanup_state().context("Failed to clean merge state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitVcs, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (GitVcs, dir)
    }

    fn commit_file(vcs: &GitVcs, dir: &Path, name: &str, content: &str, msg: &str) {
        fs::write(dir.join(name), content).unwrap();
        vcs.commit_all(msg, dir).unwrap();
    }

    #[test]
    fn test_is_repo() {
        let (vcs, dir) = setup_repo();
        assert!(vcs.is_repo(dir.path()));
        let plain = tempdir().unwrap();
        assert!(!vcs.is_repo(plain.path()));
    }

    #[test]
    fn test_commit_all_and_clean() {
        let (vcs, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        assert!(!vcs.is_clean(dir.path()).unwrap());

        let outcome = vcs.commit_all("init", dir.path()).unwrap();
        assert!(outcome.ok);
        assert!(vcs.is_clean(dir.path()).unwrap());

        // Nothing new: commit_all reports it without committing.
        let outcome = vcs.commit_all("noop", dir.path()).unwrap();
        assert!(!outcome.ok);
    }

    #[test]
    fn test_branch_create_checkout_current() {
        let (vcs, dir) = setup_repo();
        commit_file(&vcs, dir.path(), "a.txt", "hello", "init");

        let base = vcs.current_branch(dir.path()).unwrap();
        vcs.create_branch("crucible/s1", dir.path()).unwrap();
        vcs.checkout_branch("crucible/s1", dir.path()).unwrap();
        assert_eq!(vcs.current_branch(dir.path()).unwrap(), "crucible/s1");

        vcs.checkout_branch(&base, dir.path()).unwrap();
        assert_eq!(vcs.current_branch(dir.path()).unwrap(), base);
    }

    #[test]
    fn test_stash_and_pop() {
        let (vcs, dir) = setup_repo();
        commit_file(&vcs, dir.path(), "a.txt", "v1", "init");

        fs::write(dir.path().join("a.txt"), "dirty").unwrap();
        assert!(vcs.stash("wip", dir.path()).unwrap());
        assert!(vcs.is_clean(dir.path()).unwrap());

        vcs.stash_pop(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "dirty");
    }

    #[test]
    fn test_stash_nothing_returns_false() {
        let (vcs, dir) = setup_repo();
        commit_file(&vcs, dir.path(), "a.txt", "v1", "init");
        assert!(!vcs.stash("nothing", dir.path()).unwrap());
    }

    #[test]
    fn test_fast_forward_merge() {
        let (vcs, dir) = setup_repo();
        commit_file(&vcs, dir.path(), "a.txt", "base", "init");
        let base = vcs.current_branch(dir.path()).unwrap();

        vcs.create_branch("feature", dir.path()).unwrap();
        vcs.checkout_branch("feature", dir.path()).unwrap();
        commit_file(&vcs, dir.path(), "b.txt", "feature work", "feature");

        vcs.checkout_branch(&base, dir.path()).unwrap();
        let outcome = vcs.merge_branch("feature", dir.path()).unwrap();
        assert_eq!(outcome, MergeOutcome::FastForward);
        assert!(dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_conflicting_merge_lists_files_and_aborts() {
        let (vcs, dir) = setup_repo();
        commit_file(&vcs, dir.path(), "a.txt", "base\n", "init");
        let base = vcs.current_branch(dir.path()).unwrap();

        vcs.create_branch("feature", dir.path()).unwrap();
        vcs.checkout_branch("feature", dir.path()).unwrap();
        commit_file(&vcs, dir.path(), "a.txt", "feature side\n", "feature edit");

        vcs.checkout_branch(&base, dir.path()).unwrap();
        commit_file(&vcs, dir.path(), "a.txt", "base side\n", "base edit");

        let outcome = vcs.merge_branch("feature", dir.path()).unwrap();
        match outcome {
            MergeOutcome::Conflict(files) => assert_eq!(files, vec!["a.txt"]),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(vcs.conflict_files(dir.path()).unwrap(), vec!["a.txt"]);

        vcs.merge_abort(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "base side\n"
        );
    }

    #[test]
    fn test_delete_branch() {
        let (vcs, dir) = setup_repo();
        commit_file(&vcs, dir.path(), "a.txt", "x", "init");
        vcs.create_branch("gone", dir.path()).unwrap();
        vcs.delete_branch("gone", dir.path()).unwrap();
        assert!(vcs.merge_branch("gone", dir.path()).is_err());
    }
}
