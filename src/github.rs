//! Source-hosting API client for merged pull requests.
//!
//! Lists closed PRs against the main base branch, newest-updated first,
//! page by page. Only the fields the cache phase stores are deserialized.
//! A token is optional; when present it is sent as a bearer header and
//! never logged.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const PER_PAGE: usize = 100;

/// One merged pull request as reported by the hosting API.
#[derive(Debug, Clone)]
pub struct PrChange {
    pub number: i32,
    pub title: String,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub state: String,
    pub base_ref: String,
    pub base_sha: Option<String>,
    pub head_sha: Option<String>,
    pub merge_commit_sha: Option<String>,
}

/// One page of results.
#[derive(Debug)]
pub struct FetchPage {
    /// Merged PRs on this page, in API order (updated descending).
    pub prs: Vec<PrChange>,
    /// Whether another page may follow.
    pub has_more: bool,
}

#[derive(Deserialize)]
struct ApiPull {
    number: i32,
    title: Option<String>,
    body: Option<String>,
    user: Option<ApiUser>,
    created_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
    state: String,
    base: ApiRef,
    head: ApiRef,
    merge_commit_sha: Option<String>,
}

#[derive(Deserialize)]
struct ApiUser {
    login: String,
}

#[derive(Deserialize)]
struct ApiRef {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: Option<String>,
}

/// Paginated fetcher for one repository.
#[derive(Debug, Clone)]
pub struct GitHubFetcher {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitHubFetcher {
    pub fn new(owner: &str, repo: &str, token: Option<String>) -> Self {
        GitHubFetcher {
            http: reqwest::Client::new(),
            api_base: "https://api.github.com".to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
        }
    }

    /// Fetch one page of closed, main-based PRs sorted by update time
    /// descending. PRs that were never merged are dropped.
    pub async fn fetch_page(&self, page: u32) -> Result<FetchPage> {
        let url = format!(
            "{}/repos/{}/{}/pulls",
            self.api_base, self.owner, self.repo
        );

        let mut request = self
            .http
            .get(&url)
            .query(&[
                ("state", "closed"),
                ("base", "main"),
                ("sort", "updated"),
                ("direction", "desc"),
                ("per_page", &PER_PAGE.to_string()),
                ("page", &page.to_string()),
            ])
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "platform-fabric");

        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("list pull requests page {}", page))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "list pull requests page {}: API returned {}: {}",
                page,
                status,
                body
            );
        }

        let pulls: Vec<ApiPull> = response
            .json()
            .await
            .with_context(|| "decode pull request list")?;

        let fetched = pulls.len();
        let prs = pulls
            .into_iter()
            .filter(|p| p.merged_at.is_some())
            .map(|p| PrChange {
                number: p.number,
                title: p.title.unwrap_or_default(),
                body: p.body.unwrap_or_default(),
                author: p.user.map(|u| u.login).unwrap_or_default(),
                created_at: p.created_at,
                merged_at: p.merged_at,
                state: p.state,
                base_ref: p.base.ref_name,
                base_sha: p.base.sha,
                head_sha: p.head.sha,
                merge_commit_sha: p.merge_commit_sha,
            })
            .collect();

        Ok(FetchPage {
            prs,
            has_more: fetched == PER_PAGE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_pull_decoding() {
        let payload = serde_json::json!([{
            "number": 17,
            "title": "Fix frontend routing",
            "body": null,
            "user": {"login": "octocat"},
            "created_at": "2024-05-01T10:00:00Z",
            "merged_at": "2024-05-02T09:30:00Z",
            "state": "closed",
            "base": {"ref": "main", "sha": "aaa"},
            "head": {"ref": "fix/routing", "sha": "bbb"},
            "merge_commit_sha": "ccc"
        }, {
            "number": 18,
            "title": "Abandoned",
            "body": "never merged",
            "user": {"login": "octocat"},
            "created_at": "2024-05-01T10:00:00Z",
            "merged_at": null,
            "state": "closed",
            "base": {"ref": "main", "sha": null},
            "head": {"ref": "wip", "sha": null},
            "merge_commit_sha": null
        }]);

        let pulls: Vec<ApiPull> = serde_json::from_value(payload).unwrap();
        assert_eq!(pulls.len(), 2);
        assert_eq!(pulls[0].number, 17);
        assert_eq!(pulls[0].body, None);
        assert!(pulls[0].merged_at.is_some());
        assert!(pulls[1].merged_at.is_none());
        assert_eq!(pulls[0].base.ref_name, "main");
    }
}
