//! Job commands.

use crate::client::{ApiClient, JobRef};
use anyhow::Result;
use gantry_core::Job;
use reqwest::Method;

pub async fn set_paused(client: &ApiClient, job: &JobRef, paused: bool) -> Result<()> {
    let action = if paused { "pause" } else { "unpause" };
    let request = client.request(Method::PUT, &format!("{}/{}", job.path(), action))?;
    let updated: Job = client.json(request).await?;

    if updated.paused {
        println!("Paused {}", job);
    } else {
        println!("Unpaused {}", job);
    }
    if updated.pipeline_paused {
        println!("  note: pipeline {} is paused", updated.pipeline_name);
    }
    Ok(())
}
