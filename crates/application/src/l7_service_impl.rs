use domain::service::entity::{LbSvc, ResourceName, ServiceName};
use domain::service::error::ServiceError;

use crate::service_registry_impl::ServiceRegistry;

/// L7 proxy redirection and backend sync registration.
impl ServiceRegistry {
    /// Redirect traffic of every frontend named `name` to the local proxy
    /// listening on `proxy_port`. Only one resource may hold the redirect at a
    /// time. A zero port only registers for backend sync.
    pub fn register_l7lb_service(
        &mut self,
        name: &ServiceName,
        resource: &ResourceName,
        proxy_port: u16,
    ) -> Result<(), ServiceError> {
        let changed = self.l7.register(name, resource, proxy_port)?;
        tracing::debug!(
            service = %name,
            resource = %resource,
            proxy_port,
            changed,
            "registered L7 load balancer service"
        );
        if changed {
            self.reupsert_by_name(name)?;
        }
        Ok(())
    }

    /// Push the backends of `name` to the proxy without redirecting traffic.
    pub fn register_l7lb_backend_sync(
        &mut self,
        name: &ServiceName,
        resource: &ResourceName,
    ) -> Result<(), ServiceError> {
        self.register_l7lb_service(name, resource, 0)
    }

    /// Drop every claim `resource` holds on `name`.
    pub fn remove_l7lb_service(
        &mut self,
        name: &ServiceName,
        resource: &ResourceName,
    ) -> Result<(), ServiceError> {
        if self.l7.remove(name, resource) {
            tracing::debug!(service = %name, resource = %resource, "removed L7 load balancer service");
            self.reupsert_by_name(name)?;
        }
        Ok(())
    }

    /// Proxy port `name` is redirected to, 0 when not redirected.
    pub fn l7lb_proxy_port(&self, name: &ServiceName) -> u16 {
        self.l7.redirect_port(name)
    }

    fn reupsert_by_name(&mut self, name: &ServiceName) -> Result<(), ServiceError> {
        let mut svcs: Vec<LbSvc> = self
            .services
            .values()
            .filter(|r| &r.name == name)
            .map(|r| r.to_svc())
            .collect();
        svcs.sort_by_key(|s| s.frontend.id);
        for svc in svcs {
            self.upsert_inner(svc, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use domain::service::entity::{BackendId, Provenance, ServiceId};
    use domain::service::options::RegistryOptions;

    use crate::test_support::*;

    use super::*;

    fn web() -> ServiceName {
        ServiceName::new("default", "web")
    }

    fn cec(name: &str) -> ResourceName {
        ResourceName::new("default", name)
    }

    fn affinity_opts() -> RegistryOptions {
        RegistryOptions {
            enable_session_affinity: true,
            ..RegistryOptions::default()
        }
    }

    #[test]
    fn registration_redirects_existing_services() {
        let h = Harness::new(RegistryOptions::default());
        let mut reg = h.registry();
        let (_, id) = reg
            .upsert(lb_svc("10.0.0.1", 80, &[("10.0.0.5", 8080)]).with_name(web()))
            .unwrap();

        reg.register_l7lb_service(&web(), &cec("a"), 9090).unwrap();
        assert_eq!(reg.get_by_id(id).unwrap().l7_lb_proxy_port, 9090);
        assert_eq!(h.map.last_upsert().unwrap().l7_lb_proxy_port, 9090);
    }

    #[test]
    fn conflicting_registration_names_holder() {
        let h = Harness::new(RegistryOptions::default());
        let mut reg = h.registry();
        let (_, id) = reg
            .upsert(lb_svc("10.0.0.1", 80, &[("10.0.0.5", 8080)]).with_name(web()))
            .unwrap();
        reg.register_l7lb_service(&web(), &cec("a"), 9090).unwrap();

        let err = reg
            .register_l7lb_service(&web(), &cec("b"), 9091)
            .unwrap_err();
        assert!(matches!(err, ServiceError::L7RedirectConflict { .. }));
        assert!(err.to_string().contains("default/a"));
        assert_eq!(reg.get_by_id(id).unwrap().l7_lb_proxy_port, 9090);
    }

    #[test]
    fn later_upserts_pick_up_redirect() {
        let h = Harness::new(RegistryOptions::default());
        let mut reg = h.registry();
        reg.register_l7lb_service(&web(), &cec("a"), 9090).unwrap();
        let (_, id) = reg
            .upsert(lb_svc("10.0.0.1", 80, &[]).with_name(web()))
            .unwrap();
        assert_eq!(reg.get_by_id(id).unwrap().l7_lb_proxy_port, 9090);
    }

    #[test]
    fn redirect_disables_session_affinity() {
        let h = Harness::new(affinity_opts());
        let mut reg = h.registry();
        let mut svc = lb_svc("10.0.0.1", 80, &[("10.0.0.5", 8080)]).with_name(web());
        svc.session_affinity = true;
        let (_, id) = reg.upsert(svc.clone()).unwrap();
        assert_eq!(h.map.affinity(id).len(), 1);

        reg.register_l7lb_service(&web(), &cec("a"), 9090).unwrap();
        assert!(h.map.affinity(id).is_empty());
        assert_eq!(reg.get_by_id(id).unwrap().l7_lb_proxy_port, 9090);

        reg.upsert(svc).unwrap();
        assert!(h.map.affinity(id).is_empty());
        let snap = reg.get_by_id(id).unwrap();
        assert!(!snap.session_affinity);
        assert_eq!(snap.l7_lb_proxy_port, 9090);
        assert!(!h.map.last_upsert().unwrap().session_affinity);
    }

    #[test]
    fn removal_clears_redirect() {
        let h = Harness::new(RegistryOptions::default());
        let mut reg = h.registry();
        let (_, id) = reg
            .upsert(lb_svc("10.0.0.1", 80, &[]).with_name(web()))
            .unwrap();
        reg.register_l7lb_service(&web(), &cec("a"), 9090).unwrap();
        reg.remove_l7lb_service(&web(), &cec("a")).unwrap();
        assert_eq!(reg.get_by_id(id).unwrap().l7_lb_proxy_port, 0);
        assert_eq!(reg.l7lb_proxy_port(&web()), 0);
    }

    #[test]
    fn backend_sync_pushes_endpoints_without_redirect() {
        let h = Harness::new(RegistryOptions::default());
        let mut reg = h.registry();
        let (_, id) = reg
            .upsert(lb_svc("10.0.0.1", 80, &[("10.0.0.5", 8080)]).with_name(web()))
            .unwrap();
        assert!(h.proxy.pushes().is_empty());

        reg.register_l7lb_backend_sync(&web(), &cec("a")).unwrap();
        assert_eq!(reg.get_by_id(id).unwrap().l7_lb_proxy_port, 0);
        let pushes = h.proxy.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, web());
        assert_eq!(pushes[0].1, vec![key("10.0.0.5", 8080)]);
    }

    #[test]
    fn reupsert_keeps_restored_provenance() {
        let h = Harness::new(RegistryOptions::default());
        h.map.seed_backend(backend("10.0.0.5", 8080).with_id(BackendId(7)));
        h.map.seed_service(restored_svc(3, "10.0.0.1", 80, &[(7, "10.0.0.5", 8080)]));
        let mut reg = h.registry();
        reg.restore_all();

        reg.services.get_mut(&ServiceId(3)).unwrap().name = web();

        reg.register_l7lb_service(&web(), &cec("a"), 9090).unwrap();
        assert_eq!(reg.provenance(ServiceId(3)), Some(Provenance::RestoredUnconfirmed));
        assert_eq!(reg.get_by_id(ServiceId(3)).unwrap().l7_lb_proxy_port, 9090);
    }
}
