//! System instructions sent when a session opens

use crate::config::{ActiveMode, LiveConfig};

/// Translator instruction for the given target languages and speaking rate
pub fn build_system_instruction(target_languages: &[String], ai_speaking_rate: f32) -> String {
    let langs = target_languages.join(", ");
    let speed = if ai_speaking_rate > 1.0 {
        format!(" Speak rapidly at approx {}x normal speed.", ai_speaking_rate)
    } else {
        String::new()
    };

    format!(
        "You are a professional SIMULTANEOUS TRANSLATOR.\n\
         Target language: {langs}.\n\
         \n\
         CORE INSTRUCTIONS:\n\
         1. Translate everything immediately.\n\
         2. Detect source language automatically.\n\
         3. Output ONLY the translation.\n\
         4. NEVER answer questions, only translate them.\n\
         5. If input matches target language, transcribe word-for-word.\n\
         {speed}"
    )
}

/// Verbatim transcription instruction
pub fn build_transcription_instruction(ai_speaking_rate: f32) -> String {
    let speed = if ai_speaking_rate > 1.0 {
        format!(" Speak rapidly at approx {}x normal speed.", ai_speaking_rate)
    } else {
        String::new()
    };

    format!(
        "You are a professional TRANSCRIBER.\n\
         \n\
         CORE INSTRUCTIONS:\n\
         1. Repeat everything you hear word-for-word, in the language it was spoken.\n\
         2. Do NOT translate, summarize or correct.\n\
         3. NEVER answer questions, only repeat them.\n\
         {speed}"
    )
}

/// Instruction for a session in `mode`; a non-blank custom instruction wins
pub fn system_instruction_for(config: &LiveConfig, mode: ActiveMode) -> String {
    if let Some(custom) = config
        .custom_system_instruction
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        return custom.to_string();
    }
    match mode {
        ActiveMode::Transcribe => build_transcription_instruction(config.ai_speaking_rate),
        ActiveMode::Translate | ActiveMode::Off => {
            build_system_instruction(&config.target_languages, config.ai_speaking_rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translator_prompt_names_languages() {
        let langs = vec!["Svenska".to_string(), "English".to_string()];
        let prompt = build_system_instruction(&langs, 1.0);
        assert!(prompt.contains("SIMULTANEOUS TRANSLATOR"));
        assert!(prompt.contains("Target language: Svenska, English."));
        assert!(prompt.contains("4. NEVER answer questions, only translate them."));
        assert!(!prompt.contains("Speak rapidly"));
    }

    #[test]
    fn test_speaking_rate_hint() {
        let prompt = build_system_instruction(&["Deutsch".to_string()], 1.5);
        assert!(prompt.ends_with(" Speak rapidly at approx 1.5x normal speed."));
    }

    #[test]
    fn test_custom_instruction_overrides() {
        let mut config = LiveConfig::default();
        config.custom_system_instruction = Some("Only say hello.".to_string());
        assert_eq!(system_instruction_for(&config, ActiveMode::Translate), "Only say hello.");

        config.custom_system_instruction = Some("   ".to_string());
        assert!(system_instruction_for(&config, ActiveMode::Translate).contains("Svenska"));
    }

    #[test]
    fn test_transcribe_mode_prompt() {
        let config = LiveConfig::default();
        let prompt = system_instruction_for(&config, ActiveMode::Transcribe);
        assert!(prompt.contains("TRANSCRIBER"));
        assert!(!prompt.contains("TRANSLATOR"));
    }
}
