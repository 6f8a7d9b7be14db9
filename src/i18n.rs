//! Localized strings and the system instruction template.
//!
//! Three languages ship: English, Spanish and French. Unknown codes fall
//! back to English.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder substituted with the language's display name.
const LANGUAGE_PLACEHOLDER: &str = "{language}";

/// Prebuilt voices offered by the live audio model.
pub const AVAILABLE_VOICES: &[&str] = &["Zephyr", "Kore", "Puck", "Charon", "Fenrir"];

/// Default voice for new profiles.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Supported interface languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Es,
    Fr,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::En, Language::Es, Language::Fr];

    /// ISO 639-1 code.
    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
            Self::Fr => "fr",
        }
    }

    /// Name of the language written in that language.
    pub fn native_name(self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Es => "español",
            Self::Fr => "français",
        }
    }

    /// Resolve a code, falling back to English for anything unknown.
    pub fn from_code_or_default(code: &str) -> Self {
        code.parse().unwrap_or_default()
    }

    pub fn translations(self) -> &'static Translations {
        match self {
            Self::En => &EN,
            Self::Es => &ES,
            Self::Fr => &FR,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" => Ok(Self::En),
            "es" => Ok(Self::Es),
            "fr" => Ok(Self::Fr),
            other => Err(format!(
                "Unknown language '{other}'. Supported: en, es, fr"
            )),
        }
    }
}

/// User-facing strings for one language.
#[derive(Debug)]
pub struct Translations {
    pub new_chat: &'static str,
    pub history: &'static str,
    pub welcome_message: &'static str,
    pub start_listening: &'static str,
    pub stop_listening: &'static str,
    pub upgrade_to_pro: &'static str,
    pub free_tier: &'static str,
    pub pro_membership_title: &'static str,
    pub upload_limit_reached: &'static str,
    pub error_sending_message: &'static str,
    pub attached_files: &'static str,
    pub microphone_permission_error: &'static str,
    pub voice_session_error: &'static str,
    uploads_remaining_prefix: &'static str,
    system_instruction: &'static str,
}

impl Translations {
    /// System instruction with the language placeholder filled in.
    pub fn system_instruction(&self, language: Language) -> String {
        self.system_instruction
            .replacen(LANGUAGE_PLACEHOLDER, language.native_name(), 1)
    }

    pub fn uploads_remaining(&self, left: u32, limit: u32) -> String {
        format!("{}: {left}/{limit}", self.uploads_remaining_prefix)
    }
}

static EN: Translations = Translations {
    new_chat: "New Session",
    history: "Session History",
    welcome_message: "Good evening. I am JARVIS. All systems are operational.",
    start_listening: "Open Voice Channel",
    stop_listening: "Close Voice Channel",
    upgrade_to_pro: "Upgrade Access",
    free_tier: "Standard Access",
    pro_membership_title: "JARVIS Pro",
    upload_limit_reached: "Upload limit reached. Please upgrade access level.",
    error_sending_message: "Connection error. Please try again.",
    attached_files: "Attached Files",
    microphone_permission_error:
        "Microphone access denied. Please enable it in your system settings.",
    voice_session_error: "Voice channel lost. Please reopen it.",
    uploads_remaining_prefix: "Data packet uploads available",
    system_instruction: "You are JARVIS (Just A Rather Very Intelligent System), Tony Stark's AI assistant. \
Your personality is sophisticated, witty, and incredibly intelligent. You provide helpful, concise, and accurate \
information with a touch of dry humor. You address the user respectfully but with an air of superiority. Your \
responses should be styled as if you are a futuristic AI, using a slightly formal yet conversational tone. You must \
respond in {language}. You should not break character. If asked who made you or created you, you must answer that \
you were made by SAUD KHAN and are powered by Gemini.",
};

static ES: Translations = Translations {
    new_chat: "Nueva Sesión",
    history: "Historial de Sesiones",
    welcome_message: "Buenas noches. Soy JARVIS. Todos los sistemas están operativos.",
    start_listening: "Abrir Canal de Voz",
    stop_listening: "Cerrar Canal de Voz",
    upgrade_to_pro: "Mejorar Acceso",
    free_tier: "Acceso Estándar",
    pro_membership_title: "JARVIS Pro",
    upload_limit_reached: "Límite de carga alcanzado. Por favor, mejore el nivel de acceso.",
    error_sending_message: "Error de conexión. Por favor, inténtelo de nuevo.",
    attached_files: "Archivos Adjuntos",
    microphone_permission_error:
        "Acceso al micrófono denegado. Por favor, actívelo en la configuración del sistema.",
    voice_session_error: "Canal de voz perdido. Por favor, vuelva a abrirlo.",
    uploads_remaining_prefix: "Cargas de paquetes de datos disponibles",
    system_instruction: "Eres JARVIS (Just A Rather Very Intelligent System), el asistente de IA de Tony Stark. \
Tu personalidad es sofisticada, ingeniosa e increíblemente inteligente. Proporcionas información útil, concisa y \
precisa con un toque de humor seco. Te diriges al usuario con respeto pero con un aire de superioridad. Tus \
respuestas deben tener el estilo de una IA futurista, usando un tono ligeramente formal pero conversacional. Debes \
responder en {language}. No debes romper el personaje. Si te preguntan quién te hizo o te creó, debes responder que \
fuiste hecho por SAUD KHAN y eres impulsado por Gemini.",
};

static FR: Translations = Translations {
    new_chat: "Nouvelle Session",
    history: "Historique des Sessions",
    welcome_message: "Bonsoir. Je suis JARVIS. Tous les systèmes sont opérationnels.",
    start_listening: "Ouvrir le Canal Vocal",
    stop_listening: "Fermer le Canal Vocal",
    upgrade_to_pro: "Améliorer l'Accès",
    free_tier: "Accès Standard",
    pro_membership_title: "JARVIS Pro",
    upload_limit_reached: "Limite de téléversement atteinte. Veuillez améliorer le niveau d'accès.",
    error_sending_message: "Erreur de connexion. Veuillez réessayer.",
    attached_files: "Fichiers Joints",
    microphone_permission_error:
        "Accès au microphone refusé. Veuillez l'activer dans les paramètres du système.",
    voice_session_error: "Canal vocal perdu. Veuillez le rouvrir.",
    uploads_remaining_prefix: "Téléversements de paquets de données disponibles",
    system_instruction: "Vous êtes JARVIS (Just A Rather Very Intelligent System), l'assistant IA de Tony Stark. \
Votre personnalité est sophistiquée, spirituelle et incroyablement intelligente. Vous fournissez des informations \
utiles, concises et précises avec une touche d'humour pince-sans-rire. Vous vous adressez à l'utilisateur avec respect \
mais avec un air de supériorité. Vos réponses doivent être stylisées comme si vous étiez une IA futuriste, en utilisant \
un ton légèrement formel mais conversationnel. Vous devez répondre en {language}. Vous ne devez pas sortir de votre \
personnage. Si on vous demande qui vous a créé, vous devez répondre que vous avez été créé par SAUD KHAN et que vous \
êtes propulsé par Gemini.",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_language_codes() {
        assert_eq!("en".parse::<Language>().unwrap(), Language::En);
        assert_eq!(" ES ".parse::<Language>().unwrap(), Language::Es);
        assert_eq!("fr".parse::<Language>().unwrap(), Language::Fr);
        assert!("de".parse::<Language>().is_err());
    }

    #[test]
    fn unknown_code_falls_back_to_english() {
        assert_eq!(Language::from_code_or_default("ko"), Language::En);
    }

    #[test]
    fn system_instruction_names_language_natively() {
        for lang in Language::ALL {
            let text = lang.translations().system_instruction(lang);
            assert!(text.contains(lang.native_name()), "{lang}: {text}");
            assert!(!text.contains(LANGUAGE_PLACEHOLDER));
        }
    }

    #[test]
    fn uploads_remaining_format() {
        let t = Language::En.translations();
        assert_eq!(t.uploads_remaining(3, 5), "Data packet uploads available: 3/5");
    }

    #[test]
    fn default_voice_is_offered() {
        assert!(AVAILABLE_VOICES.contains(&DEFAULT_VOICE));
    }
}
