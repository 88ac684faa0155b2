use crate::ranker::SectionFilter;

const SUMMARY_TERMS: &[&str] = &["resumen", "ejecutivo", "executivo", "summary"];
const ANNEX_TERMS: &[&str] = &["anexo", "anexos", "annex"];

/// Chooses a section filter from words in the question.
pub fn route_section(question: &str) -> SectionFilter {
    let lowered = question.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let mentions = |terms: &[&str]| words.iter().any(|w| terms.contains(w));
    if mentions(SUMMARY_TERMS) {
        SectionFilter::Only("summary".to_string())
    } else if mentions(ANNEX_TERMS) {
        SectionFilter::Only("annex".to_string())
    } else {
        SectionFilter::All
    }
}
