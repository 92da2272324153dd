//! Voice webhook for the telephony provider.
//!
//! When a call arrives the provider asks this endpoint what to do and gets a
//! TwiML document telling it to open a media stream to the bridge.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpRequest, HttpResponse};
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use tracing::info;

pub async fn incoming_call(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    let host = if config.telephony.public_host.is_empty() {
        req.connection_info().host().to_string()
    } else {
        config.telephony.public_host.clone()
    };
    let stream_url = format!("wss://{}{}", host, config.bridge.media_path);
    info!(stream_url = %stream_url, "Incoming call, connecting media stream");

    let twiml = render_twiml(&stream_url, &config.telephony.greeting)?;
    Ok(HttpResponse::Ok().content_type("application/xml").body(twiml))
}

/// `<Response>[<Say>greeting</Say>]<Connect><Stream url=".."/></Connect></Response>`
fn render_twiml(stream_url: &str, greeting: &str) -> Result<String, AppError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write(&mut writer, Event::Start(BytesStart::new("Response")))?;

    if !greeting.is_empty() {
        write(&mut writer, Event::Start(BytesStart::new("Say")))?;
        write(&mut writer, Event::Text(BytesText::new(greeting)))?;
        write(&mut writer, Event::End(BytesStart::new("Say").to_end()))?;
    }

    write(&mut writer, Event::Start(BytesStart::new("Connect")))?;
    let mut stream = BytesStart::new("Stream");
    stream.push_attribute(("url", stream_url));
    write(&mut writer, Event::Empty(stream))?;
    write(&mut writer, Event::End(BytesStart::new("Connect").to_end()))?;
    write(&mut writer, Event::End(BytesStart::new("Response").to_end()))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| AppError::Internal(format!("TwiML is not UTF-8: {}", e)))
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<(), AppError> {
    writer
        .write_event(event)
        .map_err(|e| AppError::Internal(format!("Failed to write TwiML: {}", e)))
}
