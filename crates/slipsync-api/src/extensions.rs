//! Sliding sync extensions
//!
//! To-device, e2ee, account data, typing and receipts projections. Each
//! is a pull from the store scoped to the conn's window, with per-conn
//! watermarks for the streams that have them. To-device delivery is
//! at-least-once: the ack watermark only advances when the client echoes
//! it back via the extension's since field.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use slipsync_core::utils::retry_once;
use slipsync_core::Result;

use crate::conn::{ConnContext, ExtensionsArgs};
use crate::types::{
    AccountDataResponse, DeviceListsDelta, E2eeResponse, ExtensionsResponse, ReceiptsResponse,
    ToDeviceResponse, TypingResponse,
};

/// Default and maximum to-device batch sizes
const TO_DEVICE_DEFAULT_LIMIT: u64 = 100;
const TO_DEVICE_MAX_LIMIT: u64 = 1000;

/// Build the extensions section for one response
pub async fn build(ctx: &ConnContext, args: ExtensionsArgs<'_>) -> Result<ExtensionsResponse> {
    let mut response = ExtensionsResponse::default();

    if args.to_device {
        response.to_device = build_to_device(ctx, &args).await?;
    }
    if args.e2ee {
        response.e2ee = build_e2ee(ctx).await?;
    }
    if args.account_data {
        response.account_data =
            build_account_data(ctx, args.sent_global_account_data, &args.rooms_with_new_timeline)
                .await?;
    }
    if args.typing {
        response.typing = build_typing(ctx, &args.window_rooms, args.typing_streams).await?;
    }
    if args.receipts {
        response.receipts = build_receipts(ctx, &args.rooms_with_new_timeline).await?;
    }
    Ok(response)
}

async fn build_to_device(
    ctx: &ConnContext,
    args: &ExtensionsArgs<'_>,
) -> Result<Option<ToDeviceResponse>> {
    let since = *args.to_device_since;
    // The client acked everything up to its since token; drop that prefix
    if since > 0 {
        retry_once(|| ctx.storage.ack_to_device(&ctx.user_id, &ctx.device_id, since)).await?;
    }
    let limit = match args.to_device_limit {
        0 => TO_DEVICE_DEFAULT_LIMIT,
        limit => limit.min(TO_DEVICE_MAX_LIMIT),
    };
    let (events, watermark) = retry_once(|| {
        ctx.storage
            .to_device_messages(&ctx.user_id, &ctx.device_id, since, limit as i64)
    })
    .await?;
    if events.is_empty() {
        return Ok(None);
    }
    Ok(Some(ToDeviceResponse {
        next_batch: watermark.to_string(),
        events,
    }))
}

async fn build_e2ee(ctx: &ConnContext) -> Result<Option<E2eeResponse>> {
    let Some(data) =
        retry_once(|| ctx.storage.swallow_device_data(&ctx.user_id, &ctx.device_id)).await?
    else {
        return Ok(None);
    };
    if data.changed.is_empty() && data.left.is_empty() && data.otk_counts.is_empty() {
        return Ok(None);
    }
    let device_lists = if data.changed.is_empty() && data.left.is_empty() {
        None
    } else {
        Some(DeviceListsDelta {
            changed: data.changed,
            left: data.left,
        })
    };
    let otk = if data.otk_counts.is_empty() {
        None
    } else {
        Some(Value::Object(data.otk_counts))
    };
    Ok(Some(E2eeResponse {
        device_lists,
        device_one_time_keys_count: otk,
    }))
}

async fn build_account_data(
    ctx: &ConnContext,
    sent_global: &mut bool,
    rooms_with_new_timeline: &[String],
) -> Result<Option<AccountDataResponse>> {
    let mut response = AccountDataResponse::default();
    if !*sent_global {
        let global = retry_once(|| ctx.storage.account_data_for_room(&ctx.user_id, "")).await?;
        response.global = global
            .into_iter()
            .map(|(data_type, content)| json!({"type": data_type, "content": content}))
            .collect();
        *sent_global = true;
    }
    for room_id in rooms_with_new_timeline {
        let entries =
            retry_once(|| ctx.storage.account_data_for_room(&ctx.user_id, room_id)).await?;
        if !entries.is_empty() {
            response.rooms.insert(
                room_id.clone(),
                entries
                    .into_iter()
                    .map(|(data_type, content)| json!({"type": data_type, "content": content}))
                    .collect(),
            );
        }
    }
    if response.global.is_empty() && response.rooms.is_empty() {
        Ok(None)
    } else {
        Ok(Some(response))
    }
}

async fn build_typing(
    ctx: &ConnContext,
    window_rooms: &[String],
    typing_streams: &mut std::collections::HashMap<String, i64>,
) -> Result<Option<TypingResponse>> {
    let mut rooms = BTreeMap::new();
    for room_id in window_rooms {
        let seen = typing_streams.get(room_id).copied().unwrap_or(0);
        if let Some((user_ids, stream_id)) =
            retry_once(|| ctx.storage.typing_since(room_id, seen)).await?
        {
            typing_streams.insert(room_id.clone(), stream_id);
            rooms.insert(
                room_id.clone(),
                json!({"type": "m.typing", "content": {"user_ids": user_ids}}),
            );
        }
    }
    if rooms.is_empty() {
        Ok(None)
    } else {
        Ok(Some(TypingResponse { rooms }))
    }
}

async fn build_receipts(
    ctx: &ConnContext,
    rooms_with_new_timeline: &[String],
) -> Result<Option<ReceiptsResponse>> {
    let mut rooms = BTreeMap::new();
    for room_id in rooms_with_new_timeline {
        let receipts = retry_once(|| ctx.storage.receipts_for_room(room_id)).await?;
        if receipts.is_empty() {
            continue;
        }
        // Reassemble the m.receipt EDU shape: event -> type -> user
        let mut content: BTreeMap<String, Value> = BTreeMap::new();
        for (user_id, receipt_type, event_id, data) in receipts {
            let entry = content.entry(event_id).or_insert_with(|| json!({}));
            entry[&receipt_type][&user_id] = data;
        }
        rooms.insert(
            room_id.clone(),
            json!({"type": "m.receipt", "content": content}),
        );
    }
    if rooms.is_empty() {
        Ok(None)
    } else {
        Ok(Some(ReceiptsResponse { rooms }))
    }
}
