//! Script Registration Engine.
//!
//! Adding a script: sign, write the file, append to the scope's
//! `psscripts.ini`, commit the scope's version bump. Removing one: drop the
//! index entry (later entries shift down), commit, then delete the file.
//! Each step that fails undoes the ones before it.

use std::sync::Arc;

use soon_core::error::{CoreError, CoreResult};
use soon_core::ini;
use soon_core::script::{GpoScripts, Scope, ScriptEntry, ScriptIndex, ScriptKind};
use soon_core::types::GpoId;
use soon_sysvol::TemplateStore;

use crate::coordinator::{GpoSection, VersionCoordinator};
use crate::signer::ScriptSigner;

#[derive(Clone)]
pub struct ScriptEngine {
    coordinator: VersionCoordinator,
    signer: Option<Arc<dyn ScriptSigner>>,
}

impl ScriptEngine {
    pub fn new(coordinator: VersionCoordinator, signer: Option<Arc<dyn ScriptSigner>>) -> Self {
        Self { coordinator, signer }
    }

    /// Register a script and return its entry, including the assigned order.
    ///
    /// Content is signed before the GPO section is taken, so a slow or
    /// failing signer never holds up other writers and never leaves a
    /// partial write behind.
    pub async fn add_script(
        &self,
        id: GpoId,
        kind: ScriptKind,
        content: Vec<u8>,
        parameters: String,
    ) -> CoreResult<ScriptEntry> {
        ini::check_value("script parameters", &parameters)?;
        let content = match &self.signer {
            Some(signer) => signer.sign(&content).await?,
            None => content,
        };

        self.coordinator
            .with_section(id, move |mut section| async move {
                let entry = add_in_section(&mut section, kind, &content, &parameters).await?;
                tracing::info!(
                    gpo = %id,
                    %kind,
                    order = entry.order,
                    path = %entry.path,
                    version = section.version().raw(),
                    "Script added"
                );
                Ok(entry)
            })
            .await
    }

    /// Remove the script at `order`; later scripts of the same kind move up by one.
    pub async fn remove_script(&self, id: GpoId, kind: ScriptKind, order: u32) -> CoreResult<ScriptEntry> {
        self.coordinator
            .with_section(id, move |mut section| async move {
                let removed = remove_in_section(&mut section, kind, |_| Ok(order)).await?;
                tracing::info!(
                    gpo = %id,
                    %kind,
                    order,
                    path = %removed.path,
                    version = section.version().raw(),
                    "Script removed"
                );
                Ok(removed)
            })
            .await
    }

    /// Remove the script of `kind` stored as `path`.
    ///
    /// The order is looked up on the index read inside the section, so a
    /// concurrent removal that shifts orders cannot redirect this one.
    pub async fn remove_script_by_path(&self, id: GpoId, kind: ScriptKind, path: String) -> CoreResult<ScriptEntry> {
        self.coordinator
            .with_section(id, move |mut section| async move {
                let removed = remove_in_section(&mut section, kind, |index| {
                    index
                        .find(kind, &path)
                        .ok_or_else(|| CoreError::not_found("script", format!("{kind} {path}")))
                })
                .await?;
                tracing::info!(
                    gpo = %id,
                    %kind,
                    order = removed.order,
                    path = %removed.path,
                    version = section.version().raw(),
                    "Script removed"
                );
                Ok(removed)
            })
            .await
    }

    /// Every registered script of the GPO, by kind.
    pub async fn list_scripts(&self, id: &GpoId) -> CoreResult<GpoScripts> {
        let templates = self.coordinator.templates();
        let machine = templates.read_scripts(id, Scope::Machine).await?;
        let user = templates.read_scripts(id, Scope::User).await?;
        Ok(GpoScripts::from_indexes(&machine, &user))
    }

    /// Order of the script of `kind` stored as `path`.
    pub async fn find_script(&self, id: &GpoId, kind: ScriptKind, path: &str) -> CoreResult<u32> {
        let index = self
            .coordinator
            .templates()
            .read_scripts(id, kind.scope())
            .await?;
        index
            .find(kind, path)
            .ok_or_else(|| CoreError::not_found("script", format!("{kind} {path}")))
    }
}

/// First `script<n>.ps1`, counting up from `order`, the index does not use yet.
fn preferred_name(index: &ScriptIndex, order: usize) -> String {
    (order..)
        .map(|n| format!("script{n}.ps1"))
        .find(|name| !index.contains_path(name))
        .unwrap_or_else(|| format!("script{order}.ps1"))
}

async fn add_in_section(
    section: &mut GpoSection,
    kind: ScriptKind,
    content: &[u8],
    parameters: &str,
) -> CoreResult<ScriptEntry> {
    let id = section.id();
    let scope = kind.scope();
    let templates = section.templates().clone();

    let previous = templates.read_scripts(&id, scope).await?;
    let mut index = previous.clone();
    let preferred = preferred_name(&index, index.len(kind));
    let file_name = templates
        .write_script_file(&id, kind, &preferred, content)
        .await?;

    let order = match index.push(kind, &file_name, parameters) {
        Ok(order) => order,
        Err(e) => {
            discard_file(section, kind, &file_name).await;
            return Err(e);
        }
    };
    if let Err(e) = templates.write_scripts(&id, &index).await {
        discard_file(section, kind, &file_name).await;
        return Err(e);
    }

    if let Err(e) = section.commit(scope, true).await {
        restore_index(section, &previous).await;
        discard_file(section, kind, &file_name).await;
        return Err(e);
    }

    Ok(ScriptEntry {
        path: file_name,
        parameters: parameters.to_string(),
        order,
    })
}

async fn remove_in_section(
    section: &mut GpoSection,
    kind: ScriptKind,
    select: impl FnOnce(&ScriptIndex) -> CoreResult<u32>,
) -> CoreResult<ScriptEntry> {
    let id = section.id();
    let scope = kind.scope();
    let templates = section.templates().clone();

    let previous = templates.read_scripts(&id, scope).await?;
    let order = select(&previous)?;
    let mut index = previous.clone();
    let removed = index.remove(kind, order)?;
    templates.write_scripts(&id, &index).await?;

    if let Err(e) = section.commit(scope, false).await {
        restore_index(section, &previous).await;
        return Err(e);
    }

    // The index no longer names the file; a leftover file is harmless.
    if let Err(e) = templates.remove_script_file(&id, kind, &removed.path).await {
        tracing::warn!(gpo = %id, path = %removed.path, error = %e, "Failed to delete removed script file");
    }
    Ok(removed)
}

async fn restore_index(section: &GpoSection, previous: &ScriptIndex) {
    let id = section.id();
    if let Err(e) = section.templates().write_scripts(&id, previous).await {
        tracing::error!(gpo = %id, scope = %previous.scope(), error = %e, "Failed to restore script index");
    } else {
        tracing::warn!(gpo = %id, scope = %previous.scope(), "Script index rolled back");
    }
}

async fn discard_file(section: &GpoSection, kind: ScriptKind, file_name: &str) {
    let id = section.id();
    if let Err(e) = section.templates().remove_script_file(&id, kind, file_name).await {
        tracing::error!(gpo = %id, path = file_name, error = %e, "Failed to discard script file");
    }
}
