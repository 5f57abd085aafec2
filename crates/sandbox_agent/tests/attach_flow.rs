use parking_lot::Mutex;
use sandbox_agent::{
    lookup_attach_result, AgentLauncher, AttachCause, AttachPhase, DomainManager, FeatureMap,
    SandboxLayout,
};
use sandbox_api::loader::linked::LinkedArchiveOpener;
use sandbox_api::{
    BoundaryError, Configure, ConfigureFactory, CoreServer, ExportTable, HostScope,
    Instrumentation, LaunchMode, LoadedUnit, ServerSingleton, UnitRef,
    CORE_CONFIGURE, PROXY_CORE_SERVER,
};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SERVER_PORT: u16 = 40123;

#[derive(Default)]
struct CountingServer {
    fail_bind: bool,
    binds: AtomicUsize,
    destroys: AtomicUsize,
    local: Mutex<Option<SocketAddr>>,
    configured: Mutex<Vec<String>>,
}

impl CountingServer {
    fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

impl CoreServer for CountingServer {
    fn is_bind(&self) -> bool {
        self.local.lock().is_some()
    }

    fn bind(
        &self,
        configure: Configure,
        _inst: Arc<dyn Instrumentation>,
    ) -> Result<(), BoundaryError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let feature = configure
            .downcast::<String>()
            .map_err(|_| BoundaryError::IncompatibleConfigure("String"))?;
        self.configured.lock().push(feature.to_string());

        if self.fail_bind {
            return Err(BoundaryError::Bind {
                address: format!("127.0.0.1:{SERVER_PORT}"),
                source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        *self.local.lock() = Some(SocketAddr::from(([127, 0, 0, 1], SERVER_PORT)));
        Ok(())
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.local.lock().take();
    }

    fn local(&self) -> Result<SocketAddr, BoundaryError> {
        (*self.local.lock()).ok_or(BoundaryError::NotBound)
    }
}

#[derive(Default)]
struct RecordingInstrumentation {
    appended: Mutex<Vec<PathBuf>>,
    refuse_append: bool,
}

impl Instrumentation for RecordingInstrumentation {
    fn all_loaded_units(&self) -> Vec<UnitRef> {
        Vec::new()
    }

    fn is_modifiable_unit(&self, _unit: &dyn LoadedUnit) -> bool {
        true
    }

    fn append_to_bootstrap_search(&self, archive: &Path) -> io::Result<()> {
        if self.refuse_append {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "sealed"));
        }
        self.appended.lock().push(archive.to_path_buf());
        Ok(())
    }
}

fn core_exports(server: Arc<CountingServer>) -> impl Fn(&mut ExportTable) + Send + Sync {
    move |table: &mut ExportTable| {
        let server = server.clone();
        table
            .export(
                CORE_CONFIGURE,
                ConfigureFactory::new(|feature, _properties_path| {
                    let configure: Configure = Arc::new(feature.to_string());
                    Ok(configure)
                }),
            )
            .export(
                PROXY_CORE_SERVER,
                ServerSingleton::new(move || {
                    let server: Arc<dyn CoreServer> = server.clone();
                    server
                }),
            );
    }
}

struct Fixture {
    _root: tempfile::TempDir,
    home: PathBuf,
    layout: SandboxLayout,
    opener: Arc<LinkedArchiveOpener>,
    launcher: AgentLauncher,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let home = root.path().join("sandbox");
        let data_root = root.path().join("data");
        let layout = SandboxLayout::new(&home).with_data_root(&data_root);
        let opener = Arc::new(LinkedArchiveOpener::new());
        let domains = DomainManager::new(opener.clone(), Arc::new(HostScope::empty()));
        let launcher = AgentLauncher::new(Arc::new(domains)).with_data_root(&data_root);
        Self {
            _root: root,
            home,
            layout,
            opener,
            launcher,
        }
    }

    fn with_server(server: &Arc<CountingServer>) -> Self {
        let fixture = Self::new();
        fixture
            .opener
            .register(fixture.layout.core_archive(), core_exports(server.clone()));
        fixture
    }

    fn feature(&self, descriptor: &str) -> FeatureMap {
        FeatureMap::parse(&format!("home={};{descriptor}", self.home.display()))
    }
}

#[test]
fn first_attach_binds_once_and_records_the_endpoint() {
    let server = Arc::new(CountingServer::default());
    let fixture = Fixture::with_server(&server);
    let inst = Arc::new(RecordingInstrumentation::default());

    let result = fixture
        .launcher
        .agentmain(&fixture.feature("namespace=alpha;port=8080;token=t-1"), inst.clone())
        .unwrap();

    assert_eq!(result.namespace, "alpha");
    assert_eq!(result.token, "t-1");
    assert_eq!(result.port, server.local().unwrap().port());
    assert_eq!(server.binds(), 1);
    assert_eq!(*inst.appended.lock(), vec![fixture.layout.spy_archive()]);

    let configured = server.configured.lock().clone();
    assert_eq!(configured.len(), 1);
    assert!(configured[0].contains("mode=attach;"));
    assert!(configured[0].contains("namespace=alpha;port=8080;"));

    let recorded = lookup_attach_result(&fixture.layout.result_file(), "alpha", Some("t-1"))
        .unwrap()
        .unwrap();
    assert_eq!(recorded, result);
}

#[test]
fn repeated_attach_reuses_the_bound_server() {
    let server = Arc::new(CountingServer::default());
    let fixture = Fixture::with_server(&server);
    let inst = Arc::new(RecordingInstrumentation::default());
    let feature = fixture.feature("namespace=alpha;port=8080");

    let first = fixture
        .launcher
        .main(&feature, LaunchMode::Attach, inst.clone())
        .unwrap();
    let second = fixture
        .launcher
        .main(&feature, LaunchMode::Attach, inst)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(server.binds(), 1);
    assert_eq!(fixture.launcher.domains().namespaces(), vec!["alpha"]);
}

#[test]
fn concurrent_attaches_of_one_namespace_bind_once() {
    let server = Arc::new(CountingServer::default());
    let fixture = Fixture::with_server(&server);
    let feature = fixture.feature("namespace=alpha");

    let endpoints: Vec<SocketAddr> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let inst = Arc::new(RecordingInstrumentation::default());
                    fixture.launcher.premain(&feature, inst).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(server.binds(), 1);
    assert!(endpoints.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn failed_bind_is_torn_down_and_retried_next_time() {
    let server = Arc::new(CountingServer {
        fail_bind: true,
        ..CountingServer::default()
    });
    let fixture = Fixture::with_server(&server);
    let feature = fixture.feature("namespace=alpha;token=t-1");

    let err = fixture
        .launcher
        .agentmain(&feature, Arc::new(RecordingInstrumentation::default()))
        .unwrap_err();
    assert_eq!(err.namespace, "alpha");
    assert_eq!(err.phase, AttachPhase::Bind);
    assert!(matches!(err.cause, AttachCause::Boundary(BoundaryError::Bind { .. })));
    assert_eq!(server.destroys(), 1);
    assert!(!fixture.layout.result_file().exists());

    fixture
        .launcher
        .agentmain(&feature, Arc::new(RecordingInstrumentation::default()))
        .unwrap_err();
    assert_eq!(server.binds(), 2);
    assert_eq!(server.destroys(), 2);
}

#[test]
fn missing_core_archive_fails_domain_resolution() {
    let fixture = Fixture::new();
    let err = fixture
        .launcher
        .premain(
            &fixture.feature("namespace=beta"),
            Arc::new(RecordingInstrumentation::default()),
        )
        .unwrap_err();

    assert_eq!(err.phase, AttachPhase::ResolveDomain);
    assert!(matches!(err.cause, AttachCause::Domain(_)));
    assert!(fixture.launcher.domains().get("beta").is_none());
}

#[test]
fn refused_spy_archive_aborts_before_the_domain_exists() {
    let server = Arc::new(CountingServer::default());
    let fixture = Fixture::with_server(&server);
    let inst = Arc::new(RecordingInstrumentation {
        refuse_append: true,
        ..RecordingInstrumentation::default()
    });

    let err = fixture
        .launcher
        .premain(&fixture.feature("namespace=alpha"), inst)
        .unwrap_err();
    assert_eq!(err.phase, AttachPhase::ResolveDomain);
    assert!(matches!(err.cause, AttachCause::Io { .. }));
    assert!(fixture.launcher.domains().namespaces().is_empty());
    assert_eq!(server.binds(), 0);
}

#[test]
fn archive_without_server_fails_server_resolution() {
    let fixture = Fixture::new();
    fixture
        .opener
        .register(fixture.layout.core_archive(), |table| {
            table.export(
                CORE_CONFIGURE,
                ConfigureFactory::new(|feature, _| {
                    let configure: Configure = Arc::new(feature.to_string());
                    Ok(configure)
                }),
            );
        });

    let err = fixture
        .launcher
        .premain(
            &fixture.feature("namespace=gamma"),
            Arc::new(RecordingInstrumentation::default()),
        )
        .unwrap_err();
    assert_eq!(err.phase, AttachPhase::ResolveServer);
    assert!(matches!(err.cause, AttachCause::Resolve(_)));
}
