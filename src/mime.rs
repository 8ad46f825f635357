/// Guess a MIME type from a filename, or `None` when no mapping is known.
///
/// `.gmi` is not in the shared extension database, so it is special-cased.
pub fn guess_mime_type(filename: &str) -> Option<String> {
    if std::path::Path::new(filename)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gmi"))
    {
        return Some("text/gemini".to_string());
    }

    mime_guess::from_path(filename)
        .first()
        .map(|mime| mime.essence_str().to_string())
}
