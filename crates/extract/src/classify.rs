use std::collections::HashMap;

use labstage_core::{
    Band, ConfidenceThresholds, ExtractedField, ExtractionQuery, ExtractionResult, FieldValue,
    QueryCatalog, RawAnswer,
};

use crate::normalize::normalize;

/// Place a normalized value in its confidence band.
///
/// A value that failed to normalize has nothing to show or verify, so it is
/// suppressed regardless of score.
pub fn band_for(value: Option<FieldValue>, confidence: f32, thresholds: &ConfidenceThresholds) -> Band {
    match value {
        Some(v) if confidence >= thresholds.high() => Band::Normal(v),
        Some(v) if confidence >= thresholds.low() => Band::Flagged(v),
        _ => Band::Suppressed,
    }
}

/// Normalize then classify one answer. Total over any input.
pub fn classify(query: &ExtractionQuery, answer: &RawAnswer, thresholds: &ConfidenceThresholds) -> ExtractedField {
    let value = normalize(query.kind, &answer.text);
    if value.is_none() {
        tracing::debug!(metric = %query.metric, raw = %answer.text, "answer did not normalize");
    }
    ExtractedField {
        metric: query.metric.clone(),
        raw_text: answer.text.clone(),
        confidence: answer.confidence,
        band: band_for(value, answer.confidence, thresholds),
    }
}

/// Build the per-document result in catalog order. Every catalog metric gets
/// an entry; unanswered ones are recorded as missing.
pub fn classify_answers(
    catalog: &QueryCatalog,
    answers: &[RawAnswer],
    thresholds: &ConfidenceThresholds,
) -> ExtractionResult {
    let mut best: HashMap<&str, &RawAnswer> = HashMap::new();
    for answer in answers {
        if catalog.query(&answer.metric).is_none() {
            tracing::debug!(metric = %answer.metric, "ignoring answer for unrequested metric");
            continue;
        }
        best.entry(answer.metric.as_str())
            .and_modify(|cur| {
                if answer.confidence > cur.confidence {
                    *cur = answer;
                }
            })
            .or_insert(answer);
    }

    let mut result = ExtractionResult::new();
    for query in catalog.queries() {
        match best.get(query.metric.as_str()) {
            Some(answer) => result.insert(classify(query, answer, thresholds)),
            None => result.insert_missing(query.metric.clone()),
        }
    }
    result
}
