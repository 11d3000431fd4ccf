//! Exposes the storage engine to clients via RESP commands.
//!
//! All commands operate on the data of the service announced via `CLIENT SETNAME` and are
//! rejected with **UNAUTHORIZED** if none was announced:
//! * **CACHE.CREATE key value**: creates an entry and replies with `[key, value, created]`.
//! * **CACHE.GET key**: replies with `[key, value, created]`.
//! * **CACHE.UPDATE key value**: replaces the value of an entry and replies with
//!   `[key, value, created]`.
//! * **CACHE.DELETE key**: deletes an entry and replies with its previous `[key, value, created]`.
//! * **CACHE.ALL**: replies with an array of `[key, value, created]` (sorted by key).
//! * **CACHE.FLUSH**: deletes all entries of the service.
//! * **LIST.APPEND list id entry**: adds or replaces an item of a named list.
//! * **LIST.EVICT list id [id ...]**: removes the given items from a list.
//! * **LIST.GET list**: replies with `id, entry, id, entry, ...` (sorted by id).
//! * **LIST.ALL**: replies with `[[list, [id, entry, ...]], ...]` (sorted by list name).
//!
//! Failures are reported with their code as first word of the error (e.g. `-NOT_FOUND ...`), so
//! that clients can tell them apart from transport errors.
//!
//! As the engine might have to wait for a backend, each call is processed in its own task.
use std::sync::Arc;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::commands::{queue, Call, CommandDictionary, CommandResult, Queue, ResultExt};
use crate::platform::Platform;
use crate::response::OutputResult;
use crate::spawn;
use crate::storage::{KeyValue, ListItems, Storage, StorageEngine};

/// Enumerates the commands supported by this facility.
#[derive(FromPrimitive)]
enum Commands {
    Create,
    Get,
    Update,
    Delete,
    All,
    Flush,
    Append,
    Evict,
    ListGet,
    ListAll,
}

/// Registers the storage commands for the given storage.
///
/// This is invoked by [storage::install](crate::storage::install).
pub fn install(platform: Arc<Platform>, storage: Arc<Storage>) {
    if let Some(commands) = platform.find::<CommandDictionary>() {
        let queue = actor(storage);
        commands.register_command("CACHE.CREATE", queue.clone(), Commands::Create as usize);
        commands.register_command("CACHE.GET", queue.clone(), Commands::Get as usize);
        commands.register_command("CACHE.UPDATE", queue.clone(), Commands::Update as usize);
        commands.register_command("CACHE.DELETE", queue.clone(), Commands::Delete as usize);
        commands.register_command("CACHE.ALL", queue.clone(), Commands::All as usize);
        commands.register_command("CACHE.FLUSH", queue.clone(), Commands::Flush as usize);
        commands.register_command("LIST.APPEND", queue.clone(), Commands::Append as usize);
        commands.register_command("LIST.EVICT", queue.clone(), Commands::Evict as usize);
        commands.register_command("LIST.GET", queue.clone(), Commands::ListGet as usize);
        commands.register_command("LIST.ALL", queue, Commands::ListAll as usize);
    }
}

/// Receives incoming calls and forks a task per call.
fn actor(storage: Arc<Storage>) -> Queue {
    let (queue, mut endpoint) = queue();

    spawn!(async move {
        while let Some(call) = endpoint.recv().await {
            let engine = storage.engine().clone();
            spawn!(async move {
                handle_call(call, engine).await;
            });
        }
    });

    queue
}

async fn handle_call(mut call: Call, engine: Arc<dyn StorageEngine>) {
    let engine = engine.as_ref();
    let result = match Commands::from_usize(call.token) {
        Some(Commands::Create) => create_command(&mut call, engine).await,
        Some(Commands::Get) => get_command(&mut call, engine).await,
        Some(Commands::Update) => update_command(&mut call, engine).await,
        Some(Commands::Delete) => delete_command(&mut call, engine).await,
        Some(Commands::All) => all_command(&mut call, engine).await,
        Some(Commands::Flush) => flush_command(&mut call, engine).await,
        Some(Commands::Append) => append_command(&mut call, engine).await,
        Some(Commands::Evict) => evict_command(&mut call, engine).await,
        Some(Commands::ListGet) => list_get_command(&mut call, engine).await,
        Some(Commands::ListAll) => list_all_command(&mut call, engine).await,
        None => {
            call.handle_unknown_token();
            return;
        }
    };

    result.complete(call);
}

async fn create_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(2)?;
    let entry = engine
        .create(
            call.tenant()?,
            call.request.str_parameter(0)?,
            call.request.str_parameter(1)?,
        )
        .await?;

    write_entry(call, &entry)?;
    Ok(())
}

async fn get_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(1)?;
    let entry = engine
        .read(call.tenant()?, call.request.str_parameter(0)?)
        .await?;

    write_entry(call, &entry)?;
    Ok(())
}

async fn update_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(2)?;
    let entry = engine
        .update(
            call.tenant()?,
            call.request.str_parameter(0)?,
            call.request.str_parameter(1)?,
        )
        .await?;

    write_entry(call, &entry)?;
    Ok(())
}

async fn delete_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(1)?;
    let entry = engine
        .delete(call.tenant()?, call.request.str_parameter(0)?)
        .await?;

    write_entry(call, &entry)?;
    Ok(())
}

async fn all_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(0)?;
    let entries = engine.read_for_service(call.tenant()?).await?;

    let mut entries: Vec<KeyValue> = entries.into_values().collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    call.response.array(entries.len())?;
    for entry in &entries {
        write_entry(call, entry)?;
    }

    Ok(())
}

async fn flush_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(0)?;
    engine.delete_for_service(call.tenant()?).await?;

    call.response.ok()?;
    Ok(())
}

async fn append_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(3)?;
    engine
        .store_list_item(
            call.tenant()?,
            call.request.str_parameter(0)?,
            call.request.str_parameter(1)?,
            call.request.str_parameter(2)?,
        )
        .await?;

    call.response.ok()?;
    Ok(())
}

async fn evict_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    let ids: Vec<String> = call
        .request
        .str_parameters_from(1)?
        .into_iter()
        .map(str::to_owned)
        .collect();
    engine
        .evict_list_items(call.tenant()?, call.request.str_parameter(0)?, &ids)
        .await?;

    call.response.ok()?;
    Ok(())
}

async fn list_get_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(1)?;
    let items = engine
        .read_list(call.tenant()?, call.request.str_parameter(0)?)
        .await?;

    write_items(call, items)?;
    Ok(())
}

async fn list_all_command(call: &mut Call, engine: &dyn StorageEngine) -> CommandResult {
    call.request.expect_parameters(0)?;
    let lists = engine.read_all_lists(call.tenant()?).await?;

    let mut lists: Vec<(String, ListItems)> = lists.into_iter().collect();
    lists.sort_by(|a, b| a.0.cmp(&b.0));

    call.response.array(lists.len())?;
    for (list, items) in lists {
        call.response.array(2)?;
        call.response.bulk(list)?;
        write_items(call, items)?;
    }

    Ok(())
}

fn write_entry(call: &mut Call, entry: &KeyValue) -> OutputResult {
    call.response.array(3)?;
    call.response.bulk(&entry.key)?;
    call.response.bulk(&entry.value)?;
    call.response.bulk(entry.created_string())
}

fn write_items(call: &mut Call, items: ListItems) -> OutputResult {
    let mut items: Vec<(String, String)> = items.into_iter().collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));

    call.response.array(items.len() * 2)?;
    for (id, entry) in items {
        call.response.bulk(id)?;
        call.response.bulk(entry)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::commands::{CommandDictionary, Dispatcher};
    use crate::config::Config;
    use crate::request::Request;
    use crate::server::Connection;
    use crate::testing::{query_redis_async, test_async};
    use std::sync::Arc;

    async fn invoke(
        dispatcher: &mut Dispatcher,
        connection: &Arc<Connection>,
        request: Vec<&str>,
    ) -> String {
        let result = dispatcher
            .invoke(Request::example(request), Some(connection))
            .await
            .unwrap();
        String::from_utf8(result.to_vec()).unwrap()
    }

    #[test]
    fn commands_are_scoped_to_the_announced_service() {
        test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_commands()
                .build()
                .await
                .unwrap();
            platform
                .require::<Config>()
                .load_from_string("storage:\n    mode: inmemory", None)
                .unwrap();
            let _ = crate::storage::install(platform.clone()).await.unwrap();

            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
            let gateway = Arc::new(Connection::new("10.0.0.1:1000"));
            let discovery = Arc::new(Connection::new("10.0.0.2:1000"));

            assert_eq!(
                invoke(&mut dispatcher, &gateway, vec!["CACHE.GET", "token"]).await,
                "-UNAUTHORIZED CACHE.GET requires the client to announce its service id via \
                 CLIENT SETNAME\r\n"
            );

            gateway.set_name("gateway");
            discovery.set_name("discovery");

            assert_eq!(
                invoke(&mut dispatcher, &gateway, vec!["CACHE.CREATE", "token", "abc"])
                    .await
                    .starts_with("*3\r\n$5\r\ntoken\r\n$3\r\nabc\r\n$24\r\n"),
                true
            );
            assert_eq!(
                invoke(&mut dispatcher, &gateway, vec!["CACHE.CREATE", "token", "xyz"]).await,
                "-CONFLICT An entry 'token' already exists for service 'gateway'\r\n"
            );
            assert_eq!(
                invoke(&mut dispatcher, &discovery, vec!["CACHE.GET", "token"]).await,
                "-NOT_FOUND No entry 'token' exists for service 'discovery'\r\n"
            );
            assert_eq!(
                invoke(&mut dispatcher, &discovery, vec!["CACHE.UPDATE", "token", "x"]).await,
                "-NOT_FOUND No entry 'token' exists for service 'discovery'\r\n"
            );
            assert_eq!(
                invoke(&mut dispatcher, &gateway, vec!["CACHE.UPDATE", "token", "xyz"])
                    .await
                    .starts_with("*3\r\n$5\r\ntoken\r\n$3\r\nxyz\r\n$24\r\n"),
                true
            );
            assert_eq!(
                invoke(&mut dispatcher, &gateway, vec!["CACHE.GET", "token"])
                    .await
                    .starts_with("*3\r\n$5\r\ntoken\r\n$3\r\nxyz\r\n$24\r\n"),
                true
            );
            assert_eq!(
                invoke(&mut dispatcher, &gateway, vec!["CACHE.CREATE", "token"]).await,
                "-CLIENT: CACHE.CREATE expects 2 parameter(s) but 1 were given\r\n"
            );
        });
    }

    #[test]
    fn integration_test() {
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let platform = crate::testing::start_test_server("").await;

            let result = query_redis_async(|con| {
                redis::cmd("CLIENT")
                    .arg("SETNAME")
                    .arg("gateway")
                    .query::<()>(con)?;
                redis::cmd("CACHE.CREATE")
                    .arg("b")
                    .arg("2")
                    .query::<()>(con)?;
                redis::cmd("CACHE.CREATE")
                    .arg("a")
                    .arg("1")
                    .query::<()>(con)?;
                redis::cmd("LIST.APPEND")
                    .arg("tokens")
                    .arg("t1")
                    .arg("first")
                    .query::<()>(con)?;
                redis::cmd("LIST.APPEND")
                    .arg("tokens")
                    .arg("t1")
                    .arg("second")
                    .query::<()>(con)?;
                redis::cmd("LIST.APPEND")
                    .arg("tokens")
                    .arg("t2")
                    .arg("other")
                    .query::<()>(con)?;
                redis::cmd("LIST.EVICT")
                    .arg("tokens")
                    .arg("t2")
                    .arg("t3")
                    .query::<()>(con)?;

                let entries: Vec<(String, String, String)> =
                    redis::cmd("CACHE.ALL").query(con)?;
                let tokens: Vec<String> = redis::cmd("LIST.GET").arg("tokens").query(con)?;
                let lists: Vec<(String, Vec<String>)> = redis::cmd("LIST.ALL").query(con)?;
                let deleted: (String, String, String) =
                    redis::cmd("CACHE.DELETE").arg("a").query(con)?;
                redis::cmd("CACHE.FLUSH").query::<()>(con)?;
                let remaining: Vec<(String, String, String)> =
                    redis::cmd("CACHE.ALL").query(con)?;

                Ok((entries, tokens, lists, deleted, remaining))
            })
            .await
            .unwrap();

            let (entries, tokens, lists, deleted, remaining) = result;
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].0, "a");
            assert_eq!(entries[1].1, "2");
            assert_eq!(tokens, vec!["t1".to_owned(), "second".to_owned()]);
            assert_eq!(
                lists,
                vec![(
                    "tokens".to_owned(),
                    vec!["t1".to_owned(), "second".to_owned()]
                )]
            );
            assert_eq!(deleted.1, "1");
            assert_eq!(remaining.len(), 0);

            platform.terminate();
        });
    }
}
