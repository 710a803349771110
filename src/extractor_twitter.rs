//! Feature extractor for Twitter-style status records.
//!
//! Expects the v1.1 status shape (`full_text`, `user.screen_name`,
//! `favorite_count`, `retweet_count`, `created_at`, optional
//! `retweeted_status` / `quoted_status`).

use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use serde_json::{json, Value};

use crate::models::Record;
use crate::traits::FeatureExtractor;

/// Separator placed between a post's text and the text it quotes.
pub const QUOTE_SEPARATOR: &str = "BOWTWITTERQUOTE";

pub struct TwitterFeatureExtractor;

fn str_field<'a>(value: &'a Value, path: &str) -> Result<&'a str> {
    value
        .pointer(path)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string field {}", path))
}

impl FeatureExtractor for TwitterFeatureExtractor {
    fn id(&self) -> &str {
        "twitter"
    }

    fn extract(&self, record: &Record) -> Result<Value> {
        let tweet = &record.data;
        let submitter = str_field(tweet, "/user/screen_name")?;

        // Retweets carry the original post's text; the author stays the poster.
        let mut text = match tweet.get("retweeted_status") {
            Some(original) if !original.is_null() => str_field(original, "/full_text")?,
            _ => str_field(tweet, "/full_text")?,
        }
        .to_string();

        if let Some(quoted) = tweet.get("quoted_status").filter(|q| !q.is_null()) {
            text = format!(
                "{} {} {}",
                text,
                QUOTE_SEPARATOR,
                str_field(quoted, "/full_text")?
            );
        }

        let created_at = str_field(tweet, "/created_at")?;
        let date = DateTime::parse_from_str(created_at, "%a %b %d %H:%M:%S %z %Y")
            .or_else(|_| DateTime::parse_from_rfc3339(created_at))
            .with_context(|| format!("unparseable created_at '{}'", created_at))?;

        Ok(json!({
            "text": text,
            "likes": tweet.get("favorite_count").and_then(Value::as_u64).unwrap_or(0),
            "retweets": tweet.get("retweet_count").and_then(Value::as_u64).unwrap_or(0),
            "submitter": submitter,
            "author": submitter,
            "date": date.to_rfc3339(),
            "fingerprint": record.fingerprint,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tweet(extra: Value) -> Record {
        let mut data = json!({
            "id_str": "1",
            "full_text": "bitcoin scales",
            "favorite_count": 3,
            "retweet_count": 1,
            "created_at": "Wed Oct 10 20:19:24 +0000 2018",
            "user": { "screen_name": "synfonaut" },
        });
        if let (Some(obj), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        Record::new("f1", data)
    }

    #[test]
    fn plain_tweet() {
        let features = TwitterFeatureExtractor.extract(&tweet(json!({}))).unwrap();
        assert_eq!(features["text"], "bitcoin scales");
        assert_eq!(features["likes"], 3);
        assert_eq!(features["retweets"], 1);
        assert_eq!(features["author"], "synfonaut");
        assert_eq!(features["submitter"], "synfonaut");
        assert_eq!(features["date"], "2018-10-10T20:19:24+00:00");
        assert_eq!(features["fingerprint"], "f1");
    }

    #[test]
    fn retweet_uses_original_text_but_keeps_poster() {
        let record = tweet(json!({
            "full_text": "RT @_unwriter: ...",
            "retweeted_status": {
                "full_text": "the full original",
                "user": { "screen_name": "_unwriter" }
            }
        }));
        let features = TwitterFeatureExtractor.extract(&record).unwrap();
        assert_eq!(features["text"], "the full original");
        assert_eq!(features["author"], "synfonaut");
        assert_eq!(features["submitter"], "synfonaut");
    }

    #[test]
    fn quote_is_appended_with_separator() {
        let record = tweet(json!({
            "quoted_status": { "full_text": "quoted words" }
        }));
        let features = TwitterFeatureExtractor.extract(&record).unwrap();
        assert_eq!(
            features["text"],
            "bitcoin scales BOWTWITTERQUOTE quoted words"
        );
    }

    #[test]
    fn null_nested_statuses_are_ignored() {
        let record = tweet(json!({ "retweeted_status": null, "quoted_status": null }));
        let features = TwitterFeatureExtractor.extract(&record).unwrap();
        assert_eq!(features["text"], "bitcoin scales");
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let record = Record::new("bad", json!({ "full_text": "no user" }));
        assert!(TwitterFeatureExtractor.extract(&record).is_err());
    }
}
