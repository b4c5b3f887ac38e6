//! `report-problem/1.0` handler.
//!
//! Problem reports are surfaced as events; when the thread belongs to a
//! proof exchange, the failure is also recorded on the exchange record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    dispatch::{InboundContext, MessageHandler, OutboundMessage},
    events::{AgentEvent, EventBus},
    records::ProofExchangeRecord,
    storage::{RecordStore, TagFilter},
};

pub const PROBLEM_REPORT_TYPE: &str = "https://didcomm.org/report-problem/1.0/problem-report";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "problem-code", skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "explain-ltxt", skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
}

pub struct ProblemReportHandler {
    pub store: RecordStore,
    pub events: EventBus,
}

#[async_trait]
impl MessageHandler for ProblemReportHandler {
    fn message_type(&self) -> &'static str {
        PROBLEM_REPORT_TYPE
    }

    async fn handle(&self, ctx: InboundContext) -> Result<Option<OutboundMessage>, Error> {
        let report: ProblemReport = ctx.message.decode()?;
        let thread_id = ctx.message.thread_id().to_string();

        if let Some(mut record) = self
            .store
            .find_single_by_query::<ProofExchangeRecord>(
                &TagFilter::new().is("thread_id", thread_id.as_str()),
            )
            .await?
        {
            record.error_message = report
                .explain
                .clone()
                .or_else(|| report.code.clone());
            record.touch();
            self.store.update(&record).await?;
        }

        self.events.emit(AgentEvent::ProblemReportReceived {
            connection_id: ctx.connection.as_ref().map(|c| c.id.clone()),
            thread_id,
            code: report.code,
            explain: report.explain,
        });

        Ok(None)
    }
}
