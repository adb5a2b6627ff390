//! Outbound reply texts

pub const FULL_MENU: &str = "¡Hola! 👋 Soy Laura B. 🤖 Asistente de la Psicoterapeuta Heidy Codallo. Gracias por contactarnos. ✨\n\n\
🤖 *MENÚ DE OPCIONES*\n\n\
Seleccione un número:\n\n\
[ 1️⃣ ] 📝 Información de las Sesiones de Terapia\n\n\
[ 2️⃣ ] 📅 Agendar una cita\n\n\
[ 3️⃣ ] 👋 Salir";

pub const SHORT_MENU: &str = "🤖 *MENÚ DE OPCIONES*\n\n\
Seleccione un número:\n\n\
[ 2️⃣ ] 📅 Agendar una cita\n\n\
[ 3️⃣ ] 👋 Salir";

pub const SESSION_INFO: &str = "🤖 ¡Sí, con gusto! ✨\n\n\
📱 La sesión es online por videollamada WhatsApp\n\n\
⏱️ La duración de la sesión es de 90 minutos\n\n\
💰 El costo es de 55 USD (precio único internacional, válido desde cualquier país)\n\n\
💳 Aceptamos diferentes métodos de pago";

pub const ASK_NAME: &str = "🤖 ¡Genial! ¿Puedes indicarme su nombre completo, por favor?";

pub const EXIT_FAREWELL: &str = "🤖 Gracias por tu interés. Si necesitas ayuda más adelante, no dudes en escribirnos. ¡Bendiciones!🙏";

pub const MENU_REPROMPT: &str = "🤖 Por favor, selecciona una opción válida (1, 2 o 3).";

pub const MENU_EXHAUSTED: &str = "🤖 Parece que tienes dudas. Si necesitas ayuda más adelante, no dudes en escribirnos. ¡Bendiciones!🙏";

pub const NAME_REPROMPT: &str = "⚠️ Por favor, ingresa un nombre válido que contenga solo letras (sin números ni caracteres especiales).";

pub const NAME_EXHAUSTED: &str = "🤖 Parece que sigues ingresando un nombre inválido. Si deseas continuar, puedes intentarlo más adelante. ¡Bendiciones! 🙏";

pub const ASK_EMAIL: &str = "✅ Perfecto. Ahora, ¿puedes indicarnos tu correo electrónico? 📧\n\n\
📱 Te enviaremos promociones especiales y recordatorios relacionados con nuestras terapias.\n\n\
❌ Si no deseas compartirlo, puedes escribir 'no'.";

pub const EMAIL_REPROMPT: &str = "⚠️ El correo ingresado no parece válido. Por favor, intenta de nuevo o escribe 'no'.";

/// Sent when processing a message fails; the dialogue state is left as it was
pub const APOLOGY: &str = "🤖 Lo siento, ocurrió un error. Por favor, intenta de nuevo escribiendo 'info'.";

pub fn thank_you(name: &str) -> String {
    format!(
        "✨ ¡Gracias, {name}! ✨\n\n\
         ✅ Hemos registrado tus datos correctamente.\n\n\
         📱 Pronto te contactaremos para coordinar tu cita.\n\n\
         🙏 ¡Que tengas un excelente día!"
    )
}
