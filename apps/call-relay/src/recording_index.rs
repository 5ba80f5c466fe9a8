use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::types::RecordingDescriptor;

/// Finalized recordings keyed by call id. Entries outlive call records and are
/// never evicted.
#[derive(Default)]
pub struct RecordingIndex {
    recordings: Mutex<HashMap<String, RecordingDescriptor>>,
}

impl RecordingIndex {
    pub async fn put(&self, call_id: &str, descriptor: RecordingDescriptor) {
        self.recordings
            .lock()
            .await
            .insert(call_id.to_string(), descriptor);
    }

    pub async fn get(&self, call_id: &str) -> Option<RecordingDescriptor> {
        self.recordings.lock().await.get(call_id).cloned()
    }

    pub async fn contains(&self, call_id: &str) -> bool {
        self.recordings.lock().await.contains_key(call_id)
    }

    pub async fn len(&self) -> usize {
        self.recordings.lock().await.len()
    }
}
