use crate::types::{FormationAssignment, PageInfo};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Opaque page position: the sort key of the last item of the previous page.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub last: Vec<String>,
}

impl Cursor {
    pub fn new(last: Vec<String>) -> Self {
        Cursor { last }
    }

    pub fn encode(&self) -> String {
        // Serializing a list of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = STANDARD.decode(s.as_bytes())?;
        let cursor: Cursor = serde_json::from_slice(&decoded)?;
        Ok(cursor)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sort key of an assignment. Kind names order the same way as the kinds themselves.
pub fn assignment_key(assignment: &FormationAssignment) -> Vec<String> {
    vec![
        assignment.source.id.clone(),
        assignment.source.kind.as_str().to_string(),
        assignment.target.id.clone(),
        assignment.target.kind.as_str().to_string(),
    ]
}

/// Slices `items`, already ordered by `key`, into the page following `after`.
pub fn paginate<T, F>(
    items: Vec<T>,
    first: Option<usize>,
    after: Option<&Cursor>,
    key: F,
) -> (Vec<T>, PageInfo, usize)
where
    F: Fn(&T) -> Vec<String>,
{
    let total = items.len();
    let mut remaining: Vec<T> = match after {
        Some(cursor) => items
            .into_iter()
            .filter(|item| key(item) > cursor.last)
            .collect(),
        None => items,
    };

    let limit = first.unwrap_or(remaining.len());
    let has_next_page = remaining.len() > limit;
    remaining.truncate(limit);

    let page_info = PageInfo {
        start_cursor: remaining.first().map(|item| Cursor::new(key(item)).encode()),
        end_cursor: remaining.last().map(|item| Cursor::new(key(item)).encode()),
        has_next_page,
    };
    (remaining, page_info, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Participant, ParticipantKind};

    #[test]
    fn test_cursor_parse() {
        let encoded = STANDARD.encode(br#"{"last":["beta"]}"#);
        let cursor: Cursor = encoded.parse().unwrap();
        assert_eq!(cursor.last, vec!["beta"]);
        assert_eq!(cursor.encode().parse::<Cursor>().unwrap(), cursor);
    }

    #[test]
    fn test_invalid_cursor() {
        assert!(matches!("invalid!".parse::<Cursor>(), Err(CursorError::Base64(_))));
        let not_json = STANDARD.encode(b"nope");
        assert!(matches!(not_json.parse::<Cursor>(), Err(CursorError::Json(_))));
    }

    #[test]
    fn test_paginate() {
        let names: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        let key = |s: &String| vec![s.clone()];

        let (page, info, total) = paginate(names.clone(), Some(2), None, key);
        assert_eq!(page, vec!["a", "b"]);
        assert_eq!(total, 5);
        assert!(info.has_next_page);

        let after: Cursor = info.end_cursor.unwrap().parse().unwrap();
        let (page, info, _) = paginate(names.clone(), Some(2), Some(&after), key);
        assert_eq!(page, vec!["c", "d"]);

        let after: Cursor = info.end_cursor.unwrap().parse().unwrap();
        let (page, info, _) = paginate(names.clone(), Some(2), Some(&after), key);
        assert_eq!(page, vec!["e"]);
        assert!(!info.has_next_page);

        let (page, info, _) = paginate(names, None, None, key);
        assert_eq!(page.len(), 5);
        assert!(!info.has_next_page);
    }

    #[test]
    fn test_assignment_key_order() {
        let app = Participant::new("x", ParticipantKind::Application);
        let runtime = Participant::new("x", ParticipantKind::Runtime);
        let a = FormationAssignment::new("f", app.clone(), runtime.clone());
        let b = FormationAssignment::new("f", runtime.clone(), app.clone());
        assert_eq!(
            assignment_key(&a) < assignment_key(&b),
            (&a.source, &a.target) < (&b.source, &b.target)
        );
    }
}
