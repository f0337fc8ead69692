//! Approval consensus.
//!
//! Keeps the `approved` label of a pull request in line with what its
//! reviewers said. Three inputs drive it:
//!
//! - provider reviews (approve / request changes, GitLab approvals),
//! - changes to the `approved` label made by anyone,
//! - `/approve`, `/approve cancel` and `/approve check` comments
//!   (`/ci-approve` on GitLab).
//!
//! Only users with write access who did not author the pull request may
//! approve. A label flip by anyone else is reverted.

use async_trait::async_trait;
use prflow_core::git::{IssueComment, IssueType, PullRequest, PullRequestAction, ReviewState, User};
use prflow_core::{EventType, GitClient, GitError, GitResult, Webhook};
use tracing::{debug, info};

use crate::command::{Command, extract_commands};
use crate::plugin::{CommandHandler, WebhookPlugin};

pub const APPROVED_LABEL: &str = "approved";

pub const COMMAND_APPROVE: &str = "approve";
pub const COMMAND_GITLAB_APPROVE: &str = "ci-approve";

#[derive(Debug, Default, Clone, Copy)]
pub struct ApprovePlugin;

impl ApprovePlugin {
    pub fn new() -> Self {
        Self
    }
}

/// What a single approve command asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Approve,
    Cancel,
    Check,
}

fn intent(command: &Command) -> Option<Intent> {
    if command.name != COMMAND_APPROVE && command.name != COMMAND_GITLAB_APPROVE {
        return None;
    }
    match command.args.as_slice() {
        [] => Some(Intent::Approve),
        [arg] if arg == "cancel" => Some(Intent::Cancel),
        [arg] if arg == "check" => Some(Intent::Check),
        _ => None,
    }
}

/// Approval verdict of a comment history listed newest first.
///
/// The newest decisive entry wins: a review state, or an approve/cancel
/// command. Within one comment the first such command counts. Nothing
/// decisive means not approved.
pub fn approval_verdict(comments: &[IssueComment]) -> bool {
    for comment in comments {
        match comment.review_state {
            Some(ReviewState::Approved) => return true,
            Some(ReviewState::Unapproved) => return false,
            None => {}
        }
        for command in extract_commands(&comment.body) {
            match intent(&command) {
                Some(Intent::Approve) => return true,
                Some(Intent::Cancel) => return false,
                _ => {}
            }
        }
    }
    false
}

/// The sender may approve if they did not open the pull request and can
/// write to the repository.
pub async fn authorize(git: &dyn GitClient, sender: &User, author: &User) -> GitResult<()> {
    let unauthorized = || GitError::Unauthorized {
        user: sender.name.clone(),
        repo: git.repository().to_string(),
    };

    if sender.is_same(author) {
        return Err(unauthorized());
    }
    if git.can_user_write_to_repo(sender).await? {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

async fn approve(git: &dyn GitClient, pr: &PullRequest, user: &str) -> GitResult<()> {
    info!(user, pr = pr.id, url = %pr.url, "Pull request approved");
    git.set_label(IssueType::PullRequest, pr.id, APPROVED_LABEL)
        .await?;
    git.register_comment(IssueType::PullRequest, pr.id, &approved_comment(user))
        .await
}

async fn cancel(git: &dyn GitClient, pr: &PullRequest, user: &str) -> GitResult<()> {
    info!(user, pr = pr.id, url = %pr.url, "Approval canceled");
    git.delete_label(IssueType::PullRequest, pr.id, APPROVED_LABEL)
        .await?;
    git.register_comment(IssueType::PullRequest, pr.id, &canceled_comment(user))
        .await
}

/// Authorize `sender`; on refusal post the notice and report `false`.
async fn authorize_or_notify(
    git: &dyn GitClient,
    pr: &PullRequest,
    sender: &User,
) -> GitResult<bool> {
    match authorize(git, sender, &pr.author).await {
        Ok(()) => Ok(true),
        Err(GitError::Unauthorized { user, .. }) => {
            git.register_comment(IssueType::PullRequest, pr.id, &unauthorized_comment(&user))
                .await?;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

impl ApprovePlugin {
    async fn handle_review(&self, comment: &IssueComment, git: &dyn GitClient) -> GitResult<()> {
        let Some(pr) = comment.pull_request.as_ref().filter(|pr| pr.is_open()) else {
            return Ok(());
        };
        let Some(state) = comment.review_state else {
            return Ok(());
        };
        if !authorize_or_notify(git, pr, &comment.author).await? {
            return Ok(());
        }

        match state {
            ReviewState::Approved => approve(git, pr, &comment.author.name).await,
            ReviewState::Unapproved => cancel(git, pr, &comment.author.name).await,
        }
    }

    async fn handle_label_event(
        &self,
        pr: &PullRequest,
        sender: &User,
        git: &dyn GitClient,
    ) -> GitResult<()> {
        if !pr.label_changed.iter().any(|l| l.name == APPROVED_LABEL) {
            return Ok(());
        }
        info!(sender = %sender.name, pr = pr.id, "approved label changed");

        // The event may carry an add and a remove at once, so read the
        // current state instead of trusting the action.
        let labeled = git
            .list_labels(pr.id)
            .await?
            .iter()
            .any(|l| l.name == APPROVED_LABEL);

        match authorize(git, sender, &pr.author).await {
            Ok(()) => Ok(()),
            Err(GitError::Unauthorized { user, .. }) => {
                if labeled {
                    git.delete_label(IssueType::PullRequest, pr.id, APPROVED_LABEL)
                        .await?;
                } else {
                    git.set_label(IssueType::PullRequest, pr.id, APPROVED_LABEL)
                        .await?;
                }
                git.register_comment(IssueType::PullRequest, pr.id, &unauthorized_comment(&user))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Bring the label in line with the comment history.
    async fn check(&self, pr: &PullRequest, user: &str, git: &dyn GitClient) -> GitResult<()> {
        info!(user, pr = pr.id, "Checking approval state");
        let labeled = git
            .list_labels(pr.id)
            .await?
            .iter()
            .any(|l| l.name == APPROVED_LABEL);
        let comments = git.list_comments(pr.id).await?;
        let verdict = approval_verdict(&comments);
        debug!(pr = pr.id, labeled, verdict, "approval state");

        match (verdict, labeled) {
            (true, false) => approve(git, pr, user).await,
            (false, true) => cancel(git, pr, user).await,
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl WebhookPlugin for ApprovePlugin {
    fn name(&self) -> &str {
        "approve"
    }

    async fn handle(&self, webhook: &Webhook, git: &dyn GitClient) -> GitResult<()> {
        match webhook.event_type {
            EventType::PullRequestReviewChanged => match &webhook.issue_comment {
                Some(comment) => self.handle_review(comment, git).await,
                None => Ok(()),
            },
            EventType::PullRequestChanged => match &webhook.pull_request {
                Some(pr)
                    if matches!(
                        pr.action,
                        PullRequestAction::Labeled | PullRequestAction::Unlabeled
                    ) =>
                {
                    self.handle_label_event(pr, &webhook.sender, git).await
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CommandHandler for ApprovePlugin {
    fn commands(&self) -> &[&'static str] {
        &[COMMAND_APPROVE, COMMAND_GITLAB_APPROVE]
    }

    async fn handle_command(
        &self,
        command: &Command,
        webhook: &Webhook,
        git: &dyn GitClient,
    ) -> GitResult<()> {
        let Some(pr) = webhook
            .issue_comment
            .as_ref()
            .and_then(|c| c.pull_request.as_ref())
            .filter(|pr| pr.is_open())
        else {
            return Ok(());
        };

        if !authorize_or_notify(git, pr, &webhook.sender).await? {
            return Ok(());
        }

        let user = webhook.sender.name.as_str();
        match intent(command) {
            Some(Intent::Approve) => approve(git, pr, user).await,
            Some(Intent::Cancel) => cancel(git, pr, user).await,
            Some(Intent::Check) => self.check(pr, user, git).await,
            None => {
                git.register_comment(IssueType::PullRequest, pr.id, &help_comment())
                    .await
            }
        }
    }
}

fn unauthorized_comment(user: &str) -> String {
    format!(
        "[APPROVE ALERT]\n\n\
         User {user} is not allowed to approve/cancel approve this pull request.\n\n\
         Users who meet the following conditions can approve the pull request.\n\
         - Not an author of the pull request\n\
         - (For GitHub) Have write permission on the repository\n\
         - (For GitLab) Be Developer, Maintainer, or Owner\n"
    )
}

fn approved_comment(user: &str) -> String {
    format!("[APPROVE ALERT]\n\nUser {user} approved this pull request!")
}

fn canceled_comment(user: &str) -> String {
    format!("[APPROVE ALERT]\n\nUser {user} canceled the approval.")
}

fn help_comment() -> String {
    "[APPROVE ALERT]\n\n\
     Approve comment is malformed\n\n\
     You can approve or cancel the approval of the pull request by commenting...\n\
     - (For GitHub) `/approve`\n\
     - (For GitHub) `/approve cancel`\n\
     - (For GitLab) `/ci-approve`\n\
     - (For GitLab) `/ci-approve cancel`\n"
        .to_string()
}
