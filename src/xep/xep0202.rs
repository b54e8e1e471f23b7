//! Entity Time (XEP-0202).

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use minidom::Element;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

/// The entity-time extension.
pub struct EntityTime {
    conn: Connection,
}

impl EntityTime {
    /// Ask a peer for its wall-clock time.
    pub async fn get_time(&self, to: &Jid) -> Result<DateTime<FixedOffset>> {
        let iq = Iq::get(Element::bare("time", ns::TIME)).with_to(to.clone());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("time result without payload"))?;

        let utc = payload
            .get_child("utc", ns::TIME)
            .map(|u| u.text())
            .ok_or_else(|| Error::protocol("time result without utc"))?;
        let tzo = payload
            .get_child("tzo", ns::TIME)
            .map(|t| t.text())
            .unwrap_or_else(|| "Z".to_string());

        let utc: DateTime<Utc> = DateTime::parse_from_rfc3339(utc.trim())
            .map_err(|e| Error::parse(format!("bad utc timestamp: {e}")))?
            .with_timezone(&Utc);
        let offset = parse_tzo(tzo.trim())?;
        Ok(utc.with_timezone(&offset))
    }
}

fn parse_tzo(tzo: &str) -> Result<FixedOffset> {
    if tzo == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| Error::parse("zero offset"));
    }
    let (sign, rest) = if let Some(rest) = tzo.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = tzo.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(Error::parse(format!("bad timezone offset '{tzo}'")));
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| Error::parse(format!("bad timezone offset '{tzo}'")))?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| Error::parse(format!("bad timezone offset '{tzo}'")))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| Error::parse(format!("bad timezone offset '{tzo}'")))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| Error::parse(format!("timezone offset '{tzo}' out of range")))
}

impl Extension for EntityTime {
    fn tag(&self) -> &'static str {
        "EntityTime"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::TIME.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let is_time = matches!(
            iq.payload,
            IqPayload::Get(ref p) if p.is("time", ns::TIME)
        );
        if !is_time {
            return false;
        }

        let now = Utc::now();
        let mut time = Element::builder("time", ns::TIME).build();
        time.append_child(Element::builder("tzo", ns::TIME).append("Z").build());
        time.append_child(
            Element::builder("utc", ns::TIME)
                .append(now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true).as_str())
                .build(),
        );
        self.conn
            .send_stanza_background(Stanza::Iq(Iq::result_for(iq, Some(time))));
        true
    }
}

impl ExtensionBuild for EntityTime {
    const TAG: &'static str = "EntityTime";

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positive_and_negative_offsets() {
        assert_eq!(parse_tzo("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_tzo("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_tzo("-05:30").unwrap().local_minus_utc(), -19800);
        assert!(parse_tzo("nonsense").is_err());
    }
}
