//! Merge rules for batch payloads.

use serde_json::value::RawValue;

use super::ContentCategory;

/// Merges member payloads, in order, into one request body.
///
/// - [`ContentCategory::Json`]: a JSON array of the members' values. Member
///   text is embedded verbatim apart from surrounding whitespace.
/// - [`ContentCategory::Text`]: plain concatenation without separator.
///
/// # Errors
///
/// Returns a description of the first JSON member that does not parse.
pub fn merge_contents<'a, I>(category: ContentCategory, contents: I) -> Result<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    match category {
        ContentCategory::Text => Ok(contents.into_iter().collect()),
        ContentCategory::Json => {
            let values = contents
                .into_iter()
                .enumerate()
                .map(|(index, content)| {
                    serde_json::from_str::<&RawValue>(content.trim())
                        .map_err(|err| format!("member {index} is not valid JSON: {err}"))
                })
                .collect::<Result<Vec<_>, _>>()?;

            serde_json::to_string(&values).map_err(|err| err.to_string())
        }
    }
}
