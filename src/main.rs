mod commands;

use std::sync::Arc;

use rusqlite::Connection;
use tauri::{Manager, PhysicalPosition, PhysicalSize, WindowEvent};
use tokio::sync::Mutex;
use tracing::{error, info};

use streamchat::config::Settings;
use streamchat::ollama_api::{OllamaClient, OllamaHealth};
use streamchat::{db, logger, SessionController, TokenLedger};

use commands::{AppState, TauriSink};

// Save window state
fn save_window_state(window: &tauri::Window, conn: &Connection) -> rusqlite::Result<()> {
    if let Ok(position) = window.outer_position() {
        db::update_config_value(conn, "window_x", &position.x.to_string())?;
        db::update_config_value(conn, "window_y", &position.y.to_string())?;
    }

    if let Ok(size) = window.outer_size() {
        db::update_config_value(conn, "window_width", &size.width.to_string())?;
        db::update_config_value(conn, "window_height", &size.height.to_string())?;
    }

    Ok(())
}

fn config_number<T: std::str::FromStr>(conn: &Connection, key: &str, fallback: T) -> rusqlite::Result<T> {
    Ok(db::get_config_value(conn, key)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback))
}

// Load window state
fn load_window_state(window: &tauri::Window, conn: &Connection) -> Result<(), Box<dyn std::error::Error>> {
    let x: i32 = config_number(conn, "window_x", 100)?;
    let y: i32 = config_number(conn, "window_y", 100)?;
    let width: u32 = config_number(conn, "window_width", 1200)?;
    let height: u32 = config_number(conn, "window_height", 900)?;

    window.set_position(tauri::Position::Physical(PhysicalPosition::new(x, y)))?;
    window.set_size(PhysicalSize::new(width, height))?;
    Ok(())
}

// application entry point
fn main() {
    tauri::Builder::default()
        .setup(|app| {
            let data_dir = app
                .path_resolver()
                .app_data_dir()
                .ok_or("Failed to retrieve application data directory")?;
            let conn = db::open_db(&data_dir.join("streamchat.db"))?;

            let settings = Settings::load(&conn)?;
            logger::init_logging(&settings.log_level);
            info!(url = %settings.ollama_base_url, "starting streamchat");

            let window = app.get_window("main").ok_or("main window missing")?;
            if let Err(e) = load_window_state(&window, &conn) {
                error!(error = %e, "failed to restore window state");
            }
            let conversation_id = db::next_conversation_id(&conn)?;

            let client = OllamaClient::new(settings.ollama_base_url.clone());
            let sink = Arc::new(TauriSink::new(window.clone()));
            let ledger = Arc::new(TokenLedger::with_sink(sink.clone()));
            let controller = SessionController::new(ledger)
                .with_ui(sink.clone())
                .with_health_check(Arc::new(OllamaHealth::new(client.clone(), sink.clone())))
                .with_status_clear_delay(settings.status_clear_delay);

            let db_conn = Arc::new(Mutex::new(conn));
            app.manage(db_conn.clone());
            app.manage(AppState {
                controller: Arc::new(controller),
                client,
                sink,
                conversation_id: Mutex::new(conversation_id),
            });

            let window_clone = window.clone();
            window.on_window_event(move |event| {
                if matches!(event, WindowEvent::Resized(_) | WindowEvent::Moved(_)) {
                    let window_inner = window_clone.clone();
                    let db_inner = db_conn.clone();
                    tauri::async_runtime::spawn(async move {
                        if let Err(e) = save_window_state(&window_inner, &*db_inner.lock().await) {
                            error!(error = %e, "failed to save window state");
                        }
                    });
                }
            });

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::load_models,
            commands::get_selected_model,
            commands::save_selected_model,
            commands::update_input_draft,
            commands::generate_chat,
            commands::abort_generation,
            commands::get_token_stats,
            commands::reset_token_stats,
            commands::estimate_tokens,
            commands::new_conversation,
            commands::load_chat_history
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
