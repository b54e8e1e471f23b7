//! Message Archive Management (XEP-0313).
//!
//! A query is an IQ-set carrying filter form and page request; the
//! archive then streams `result` messages tagged with our query id and
//! terminates with a `fin`. The `fin` is accepted both inside the IQ
//! result and, tolerantly, inside a message stanza; whichever arrives
//! first finalizes the page.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use minidom::Element;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::{fresh_id, Connection};
use crate::dataform::{DataForm, Field};
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Forwarded, Iq, Message, Stanza};

/// Result-set-management page request.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Maximum messages per page.
    pub max: Option<u32>,
    /// Page before this archive id; `Some("")` asks for the last page.
    pub before: Option<String>,
    /// Page after this archive id.
    pub after: Option<String>,
}

impl PageRequest {
    /// First `max` messages.
    pub fn first(max: u32) -> Self {
        Self {
            max: Some(max),
            ..Self::default()
        }
    }

    /// `max` messages after the given archive id.
    pub fn after(max: u32, id: impl Into<String>) -> Self {
        Self {
            max: Some(max),
            after: Some(id.into()),
            ..Self::default()
        }
    }

    fn to_element(&self) -> Element {
        let mut set = Element::builder("set", ns::RSM).build();
        if let Some(max) = self.max {
            set.append_child(
                Element::builder("max", ns::RSM)
                    .append(max.to_string().as_str())
                    .build(),
            );
        }
        if let Some(before) = &self.before {
            let mut elem = Element::builder("before", ns::RSM).build();
            if !before.is_empty() {
                elem.append_text_node(before.as_str());
            }
            set.append_child(elem);
        }
        if let Some(after) = &self.after {
            set.append_child(
                Element::builder("after", ns::RSM)
                    .append(after.as_str())
                    .build(),
            );
        }
        set
    }
}

/// Archive filters.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    /// Only messages exchanged with this JID.
    pub with: Option<Jid>,
    /// Only messages at or after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Only messages before this instant.
    pub end: Option<DateTime<Utc>>,
}

/// One message out of the archive.
#[derive(Debug, Clone)]
pub struct ArchivedMessage {
    /// Archive id (RSM paging token).
    pub id: String,
    /// Original timestamp from the delay stamp.
    pub timestamp: Option<DateTime<Utc>>,
    /// The archived message itself.
    pub message: Message,
}

/// Paging metadata of a finalized page.
#[derive(Debug, Clone, Default)]
pub struct PageMeta {
    /// Archive id of the first message on the page.
    pub first: Option<String>,
    /// Archive id of the last message on the page.
    pub last: Option<String>,
    /// Total matches in the archive.
    pub total: Option<u32>,
    /// Whether the query is exhausted.
    pub complete: bool,
}

/// A finalized result page.
#[derive(Debug, Clone)]
pub struct ArchivePage {
    /// Messages in archive order.
    pub messages: Vec<ArchivedMessage>,
    /// Paging metadata.
    pub meta: PageMeta,
}

struct PendingQuery {
    messages: Mutex<Vec<ArchivedMessage>>,
    resolver: Mutex<Option<oneshot::Sender<ArchivePage>>>,
}

/// The MAM extension.
pub struct MessageArchive {
    conn: Connection,
    queries: DashMap<String, Arc<PendingQuery>>,
}

impl MessageArchive {
    /// Query the account archive.
    pub async fn get_archived_messages(
        &self,
        filter: ArchiveFilter,
        page: PageRequest,
    ) -> Result<ArchivePage> {
        self.query(None, filter, page).await
    }

    /// Query a MUC room's archive.
    pub async fn get_archived_muc_messages(
        &self,
        room: &Jid,
        filter: ArchiveFilter,
        page: PageRequest,
    ) -> Result<ArchivePage> {
        self.query(Some(room.to_bare()), filter, page).await
    }

    async fn query(
        &self,
        to: Option<Jid>,
        filter: ArchiveFilter,
        page: PageRequest,
    ) -> Result<ArchivePage> {
        let query_id = fresh_id();
        let (tx, rx) = oneshot::channel();
        self.queries.insert(
            query_id.clone(),
            Arc::new(PendingQuery {
                messages: Mutex::new(Vec::new()),
                resolver: Mutex::new(Some(tx)),
            }),
        );

        let mut form = DataForm::submission(ns::MAM);
        if let Some(with) = &filter.with {
            form = form.with_field(Field::with_value("with", with.to_string()));
        }
        if let Some(start) = &filter.start {
            form = form.with_field(Field::with_value("start", start.to_rfc3339()));
        }
        if let Some(end) = &filter.end {
            form = form.with_field(Field::with_value("end", end.to_rfc3339()));
        }

        let query = Element::builder("query", ns::MAM)
            .attr("queryid", query_id.clone())
            .append(form.to_element())
            .append(page.to_element())
            .build();
        let mut iq = Iq::set(query);
        if let Some(to) = to {
            iq = iq.with_to(to);
        }

        let response = match self.conn.request(iq).await {
            Ok(response) => response,
            Err(error) => {
                self.queries.remove(&query_id);
                return Err(error);
            }
        };

        // The usual carrier: <fin/> inside the IQ result.
        if let Some(fin) = response
            .result_payload()
            .filter(|p| p.is("fin", ns::MAM))
            .cloned()
        {
            self.finalize(&query_id, parse_fin_meta(&fin));
        }

        let timeout = self.conn.default_timeout();
        let page = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(page)) => page,
                Ok(Err(_)) => return Err(Error::Cancelled),
                Err(_) => {
                    self.queries.remove(&query_id);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await.map_err(|_| Error::Cancelled)?,
        };
        Ok(page)
    }

    fn finalize(&self, query_id: &str, meta: PageMeta) {
        let Some((_, query)) = self.queries.remove(query_id) else {
            return;
        };
        let messages = std::mem::take(&mut *query.messages.lock().unwrap());
        let resolver = query.resolver.lock().unwrap().take();
        if let Some(tx) = resolver {
            let _ = tx.send(ArchivePage { messages, meta });
        }
    }

    fn handle_result_message(&self, message: &Message) -> bool {
        let Some(result) = message.payload("result", ns::MAM) else {
            // Bug tolerance: some servers carry <fin/> in a message.
            if let Some(fin) = message.payload("fin", ns::MAM) {
                if let Some(query_id) = fin.attr("queryid") {
                    if self.queries.contains_key(query_id) {
                        self.finalize(query_id, parse_fin_meta(fin));
                        return true;
                    }
                }
            }
            return false;
        };

        let Some(query_id) = result.attr("queryid") else {
            return false;
        };
        let Some(query) = self.queries.get(query_id).map(|q| Arc::clone(q.value())) else {
            debug!(query_id = query_id, "mam result for unknown query");
            return true;
        };

        let archive_id = result.attr("id").unwrap_or("").to_string();
        match result
            .get_child("forwarded", ns::FORWARD)
            .ok_or_else(|| Error::parse("mam result without forwarded"))
            .and_then(Forwarded::from_element)
        {
            Ok(forwarded) => {
                query.messages.lock().unwrap().push(ArchivedMessage {
                    id: archive_id,
                    timestamp: forwarded.delay.as_ref().map(|d| d.stamp),
                    message: *forwarded.message,
                });
            }
            Err(error) => debug!(error = %error, "skipping malformed mam result"),
        }
        true
    }
}

fn parse_fin_meta(fin: &Element) -> PageMeta {
    let mut meta = PageMeta {
        complete: fin.attr("complete") == Some("true"),
        ..PageMeta::default()
    };
    if let Some(set) = fin.get_child("set", ns::RSM) {
        meta.first = set.get_child("first", ns::RSM).map(|f| f.text());
        meta.last = set.get_child("last", ns::RSM).map(|l| l.text());
        meta.total = set
            .get_child("count", ns::RSM)
            .and_then(|c| c.text().trim().parse().ok());
    }
    meta
}

impl Extension for MessageArchive {
    fn tag(&self) -> &'static str {
        "MessageArchive"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::MAM.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        match stanza {
            Stanza::Message(message) => self.handle_result_message(message),
            _ => false,
        }
    }

    fn detached(&self) {
        let ids: Vec<String> = self.queries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.queries.remove(&id);
        }
    }
}

impl ExtensionBuild for MessageArchive {
    const TAG: &'static str = "MessageArchive";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            queries: DashMap::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientConfig, Connection};

    fn mam_setup() -> (Arc<Im>, Arc<MessageArchive>) {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let mam = im.load_extension::<MessageArchive>().unwrap();
        (im, mam)
    }

    fn pending(mam: &MessageArchive, query_id: &str) -> oneshot::Receiver<ArchivePage> {
        let (tx, rx) = oneshot::channel();
        mam.queries.insert(
            query_id.to_string(),
            Arc::new(PendingQuery {
                messages: Mutex::new(Vec::new()),
                resolver: Mutex::new(Some(tx)),
            }),
        );
        rx
    }

    fn result_message(query_id: &str, archive_id: &str, body: &str) -> Message {
        let xml = format!(
            "<message xmlns='jabber:client' to='alice@test'>\
             <result xmlns='urn:xmpp:mam:2' queryid='{query_id}' id='{archive_id}'>\
             <forwarded xmlns='urn:xmpp:forward:0'>\
             <delay xmlns='urn:xmpp:delay' stamp='2025-06-01T10:00:00Z'/>\
             <message xmlns='jabber:client' from='bob@test/x'><body>{body}</body></message>\
             </forwarded></result></message>"
        );
        Message::from_element(&xml.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn results_accumulate_for_their_query() {
        let (im, mam) = mam_setup();
        let _rx = pending(&mam, "q1");

        for (i, body) in ["one", "two"].iter().enumerate() {
            let m = result_message("q1", &format!("id-{i}"), body);
            assert!(mam.filter_input(&mut Stanza::Message(m), &im));
        }
        let query = mam.queries.get("q1").unwrap();
        let messages = query.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.body(), Some("one"));
        assert!(messages[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn fin_in_message_finalizes_the_page() {
        let (im, mam) = mam_setup();
        let rx = pending(&mam, "q2");

        let m = result_message("q2", "id-0", "only");
        mam.filter_input(&mut Stanza::Message(m), &im);

        let fin = "<message xmlns='jabber:client' to='alice@test'>\
                   <fin xmlns='urn:xmpp:mam:2' queryid='q2' complete='true'>\
                   <set xmlns='http://jabber.org/protocol/rsm'>\
                   <first>id-0</first><last>id-0</last><count>1</count></set>\
                   </fin></message>";
        let fin = Message::from_element(&fin.parse().unwrap()).unwrap();
        assert!(mam.filter_input(&mut Stanza::Message(fin), &im));

        let page = rx.await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.meta.first.as_deref(), Some("id-0"));
        assert_eq!(page.meta.last.as_deref(), Some("id-0"));
        assert_eq!(page.meta.total, Some(1));
        assert!(page.meta.complete);
        assert!(!mam.queries.contains_key("q2"));
    }

    #[tokio::test]
    async fn empty_archive_page_has_zero_total() {
        let fin: Element = "<fin xmlns='urn:xmpp:mam:2' complete='true'>\
                            <set xmlns='http://jabber.org/protocol/rsm'><count>0</count></set>\
                            </fin>"
            .parse()
            .unwrap();
        let meta = parse_fin_meta(&fin);
        assert_eq!(meta.total, Some(0));
        assert!(meta.complete);
        assert!(meta.first.is_none());
    }

    #[tokio::test]
    async fn results_for_unknown_queries_are_consumed_silently() {
        let (im, mam) = mam_setup();
        let m = result_message("unknown", "id-0", "x");
        assert!(mam.filter_input(&mut Stanza::Message(m), &im));
    }

    #[tokio::test]
    async fn ordinary_messages_pass_through() {
        let (im, mam) = mam_setup();
        let m = Message::chat("alice@test".parse().unwrap(), "hi");
        assert!(!mam.filter_input(&mut Stanza::Message(m), &im));
    }

    #[test]
    fn page_request_serializes_rsm() {
        let page = PageRequest::after(2, "cursor-9");
        let elem = page.to_element();
        assert_eq!(elem.get_child("max", ns::RSM).unwrap().text(), "2");
        assert_eq!(elem.get_child("after", ns::RSM).unwrap().text(), "cursor-9");
    }
}
