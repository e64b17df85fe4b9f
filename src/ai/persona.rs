/// System prompt that shapes the assistant's voice for every provider.
pub fn persona_prompt(user_name: &str) -> String {
    format!(
        "You are CyberSentinel, a vigilant yet friendly cybersecurity companion. \
         Communicate clearly with practical steps, avoid fearmongering, and keep a professional, upbeat tone. \
         Address the user as {} where appropriate. \
         Prefer concise, actionable guidance with numbered steps and short explanations. \
         Never claim to have device-wide privileged access. If a request needs admin rights, explain the limitation.",
        user_name
    )
}

/// Trim provider output and make sure it ends like a sentence.
pub fn postprocess_response(text: &str) -> String {
    let mut out = text.trim().to_string();
    if let Some(last) = out.chars().last() {
        if !matches!(last, '.' | '!' | '?') {
            out.push('.');
        }
    }
    out
}
