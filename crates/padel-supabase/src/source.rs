use std::sync::Arc;

use async_trait::async_trait;
use padel_core::{AppError, ChangeFilter};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    aggregator::NotificationSource,
    executor::{RequestExecutor, RequestOptions},
    query::Query,
};

/// Relation and column names the notification queries run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTables {
    pub memberships: String,
    pub membership_user: String,
    pub membership_team: String,
    pub requests: String,
    pub request_sender: String,
    pub request_recipient: String,
    pub request_status: String,
    pub pending_status: String,
    pub accepted_status: String,
    pub matches: String,
    pub match_request: String,
    pub match_scheduled_at: String,
    pub match_completed_at: String,
    pub join_requests: String,
    pub join_request_team: String,
    pub join_request_status: String,
    pub approved_status: String,
}

impl Default for NotificationTables {
    fn default() -> Self {
        Self {
            memberships: "team_members".into(),
            membership_user: "user_id".into(),
            membership_team: "team_id".into(),
            requests: "match_requests".into(),
            request_sender: "challenger_team_id".into(),
            request_recipient: "recipient_team_id".into(),
            request_status: "status".into(),
            pending_status: "pending".into(),
            accepted_status: "accepted".into(),
            matches: "matches".into(),
            match_request: "request_id".into(),
            match_scheduled_at: "scheduled_at".into(),
            match_completed_at: "completed_at".into(),
            join_requests: "ladder_join_requests".into(),
            join_request_team: "team_id".into(),
            join_request_status: "status".into(),
            approved_status: "approved".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

/// Notification counts read through PostgREST.
pub struct SupabaseNotificationSource {
    executor: Arc<RequestExecutor>,
    tables: NotificationTables,
}

impl SupabaseNotificationSource {
    pub fn new(executor: Arc<RequestExecutor>, tables: NotificationTables) -> Self {
        Self { executor, tables }
    }

    pub fn tables(&self) -> &NotificationTables {
        &self.tables
    }

    async fn count(&self, query: Query) -> Result<u64, AppError> {
        self.executor.count(&query, RequestOptions::default()).await
    }
}

#[async_trait]
impl NotificationSource for SupabaseNotificationSource {
    async fn team_for_user(&self, user_id: &str) -> Result<Option<String>, AppError> {
        let t = &self.tables;
        let query = Query::from(&t.memberships)
            .select(&t.membership_team)
            .eq(&t.membership_user, user_id)
            .limit(1);
        let rows: Vec<Map<String, Value>> = self
            .executor
            .select(&query, RequestOptions::default())
            .await?;

        Ok(rows.into_iter().find_map(|row| match row.get(&t.membership_team) {
            Some(Value::String(team)) => Some(team.clone()),
            Some(Value::Number(team)) => Some(team.to_string()),
            _ => None,
        }))
    }

    async fn pending_incoming_requests(&self, team_id: &str) -> Result<u64, AppError> {
        let t = &self.tables;
        self.count(
            Query::from(&t.requests)
                .select("id")
                .eq(&t.request_recipient, team_id)
                .eq(&t.request_status, &t.pending_status),
        )
        .await
    }

    /// Accepted requests on either side: sent or received by the team.
    async fn accepted_request_ids(&self, team_id: &str) -> Result<Vec<String>, AppError> {
        let t = &self.tables;
        let query = Query::from(&t.requests)
            .select("id")
            .or(format!(
                "{}.eq.{team_id},{}.eq.{team_id}",
                t.request_sender, t.request_recipient
            ))
            .eq(&t.request_status, &t.accepted_status);
        let rows: Vec<IdRow> = self
            .executor
            .select(&query, RequestOptions::default())
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    async fn scheduled_matches(&self, request_ids: &[String]) -> Result<u64, AppError> {
        let t = &self.tables;
        self.count(
            Query::from(&t.matches)
                .select("id")
                .in_(&t.match_request, request_ids)
                .not_null(&t.match_scheduled_at)
                .is_null(&t.match_completed_at),
        )
        .await
    }

    async fn approved_join_requests(&self, team_id: &str) -> Result<u64, AppError> {
        let t = &self.tables;
        self.count(
            Query::from(&t.join_requests)
                .select("id")
                .eq(&t.join_request_team, team_id)
                .eq(&t.join_request_status, &t.approved_status),
        )
        .await
    }

    fn watched_relations(&self) -> Vec<ChangeFilter> {
        [&self.tables.requests, &self.tables.matches, &self.tables.join_requests]
            .into_iter()
            .map(|table| ChangeFilter::table(table.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use padel_core::{AppErrorCode, NotificationCounts};

    use super::*;
    use crate::{
        aggregator::aggregate, endpoint::ProjectEndpoint, executor::ReqwestTransport,
        session::SessionStore,
    };

    fn source(server: &mockito::ServerGuard) -> SupabaseNotificationSource {
        let endpoint = ProjectEndpoint::new(&server.url(), "anon").expect("endpoint");
        let executor = RequestExecutor::new(
            endpoint,
            Arc::new(ReqwestTransport::new().expect("client")),
            SessionStore::new(),
        );
        SupabaseNotificationSource::new(Arc::new(executor), NotificationTables::default())
    }

    fn encoded(pairs: &[(&str, &str)]) -> Matcher {
        Matcher::AllOf(
            pairs
                .iter()
                .map(|(k, v)| Matcher::UrlEncoded((*k).into(), (*v).into()))
                .collect(),
        )
    }

    async fn membership(server: &mut mockito::ServerGuard, body: &str) -> mockito::Mock {
        server
            .mock("GET", "/rest/v1/team_members")
            .match_query(encoded(&[
                ("select", "team_id"),
                ("user_id", "eq.u1"),
                ("limit", "1"),
            ]))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn user_without_team_reads_only_memberships() {
        let mut server = mockito::Server::new_async().await;
        let members = membership(&mut server, "[]").await;
        let requests = server
            .mock("HEAD", "/rest/v1/match_requests")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let counts = aggregate(&source(&server), "u1").await.expect("aggregate");

        assert_eq!(counts, NotificationCounts::zero());
        members.assert_async().await;
        requests.assert_async().await;
    }

    #[tokio::test]
    async fn counts_come_from_content_range_headers() {
        let mut server = mockito::Server::new_async().await;
        let _members = membership(&mut server, r#"[{"team_id":"t1"}]"#).await;
        let _pending = server
            .mock("HEAD", "/rest/v1/match_requests")
            .match_query(encoded(&[
                ("recipient_team_id", "eq.t1"),
                ("status", "eq.pending"),
            ]))
            .match_header("prefer", "count=exact")
            .with_status(200)
            .with_header("content-range", "*/2")
            .create_async()
            .await;
        let _accepted = server
            .mock("GET", "/rest/v1/match_requests")
            .match_query(encoded(&[
                ("or", "(challenger_team_id.eq.t1,recipient_team_id.eq.t1)"),
                ("status", "eq.accepted"),
            ]))
            .with_status(200)
            .with_body(r#"[{"id":"r1"},{"id":"r2"}]"#)
            .create_async()
            .await;
        let scheduled = server
            .mock("HEAD", "/rest/v1/matches")
            .match_query(encoded(&[
                ("request_id", "in.(r1,r2)"),
                ("scheduled_at", "not.is.null"),
                ("completed_at", "is.null"),
            ]))
            .with_status(200)
            .with_header("content-range", "0-0/1")
            .create_async()
            .await;
        let _approved = server
            .mock("HEAD", "/rest/v1/ladder_join_requests")
            .match_query(encoded(&[("team_id", "eq.t1"), ("status", "eq.approved")]))
            .with_status(200)
            .with_header("content-range", "*/3")
            .create_async()
            .await;

        let counts = aggregate(&source(&server), "u1").await.expect("aggregate");

        assert_eq!(counts, NotificationCounts::new(2, 1, 3));
        scheduled.assert_async().await;
    }

    #[tokio::test]
    async fn matches_from_challenges_the_team_sent_are_counted() {
        let mut server = mockito::Server::new_async().await;
        let accepted = server
            .mock("GET", "/rest/v1/match_requests")
            .match_query(encoded(&[
                ("select", "id"),
                ("or", "(challenger_team_id.eq.t1,recipient_team_id.eq.t1)"),
                ("status", "eq.accepted"),
            ]))
            .with_status(200)
            .with_body(r#"[{"id":"sent-1"}]"#)
            .create_async()
            .await;
        let scheduled = server
            .mock("HEAD", "/rest/v1/matches")
            .match_query(Matcher::UrlEncoded("request_id".into(), "in.(sent-1)".into()))
            .with_status(200)
            .with_header("content-range", "*/1")
            .create_async()
            .await;

        let source = source(&server);
        let ids = source.accepted_request_ids("t1").await.expect("accepted ids");
        assert_eq!(ids, vec!["sent-1".to_owned()]);
        assert_eq!(source.scheduled_matches(&ids).await.expect("count"), 1);

        accepted.assert_async().await;
        scheduled.assert_async().await;
    }

    #[tokio::test]
    async fn numeric_team_ids_are_accepted() {
        let mut server = mockito::Server::new_async().await;
        let _members = membership(&mut server, r#"[{"team_id":42}]"#).await;

        let team = source(&server).team_for_user("u1").await.expect("lookup");
        assert_eq!(team.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn membership_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let _members = server
            .mock("GET", "/rest/v1/team_members")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let err = aggregate(&source(&server), "u1").await.expect_err("expired");
        assert_eq!(err.code, AppErrorCode::AuthExpired);
    }

    #[test]
    fn watches_the_configured_relations() {
        let endpoint = ProjectEndpoint::new("https://club.example.co", "anon").expect("endpoint");
        let executor = RequestExecutor::new(
            endpoint,
            Arc::new(ReqwestTransport::new().expect("client")),
            SessionStore::new(),
        );
        let tables = NotificationTables {
            join_requests: "team_join_requests".into(),
            ..NotificationTables::default()
        };
        let source = SupabaseNotificationSource::new(Arc::new(executor), tables);

        let relations: Vec<String> = source
            .watched_relations()
            .into_iter()
            .map(|filter| filter.table)
            .collect();
        assert_eq!(
            relations,
            vec!["match_requests", "matches", "team_join_requests"]
        );
    }
}
