//! Shared test fixtures for evaluator and accessor tests.

use chrono::Utc;
use pkg_types::pod::{ContainerSpec, Pod, PodPhase, PodSpec, ResourceRequirements};
use pkg_types::quantity::{Quantity, ResourceList};
use pkg_types::service::{Service, ServicePort, ServiceSpec, ServiceType};
use pkg_types::volume::{PVCPhase, PersistentVolumeClaim};
use std::collections::HashMap;

pub fn make_pod(name: &str, namespace: &str) -> Pod {
    Pod {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: namespace.to_string(),
        spec: PodSpec {
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                image: "nginx:latest".to_string(),
                command: vec![],
                env: HashMap::new(),
                resources: ResourceRequirements::default(),
            }],
            priority_class: None,
            active_deadline_seconds: None,
        },
        phase: PodPhase::Running,
        labels: HashMap::new(),
        created_at: Utc::now(),
    }
}

pub fn pod_with_requests(name: &str, namespace: &str, cpu: &str, memory: &str) -> Pod {
    let mut pod = make_pod(name, namespace);
    let mut requests = ResourceList::new();
    requests.insert("cpu".to_string(), Quantity::parse(cpu).unwrap());
    requests.insert("memory".to_string(), Quantity::parse(memory).unwrap());
    pod.spec.containers[0].resources.requests = requests;
    pod
}

pub fn make_service(name: &str, namespace: &str) -> Service {
    Service {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: namespace.to_string(),
        spec: ServiceSpec {
            selector: HashMap::new(),
            ports: vec![ServicePort {
                name: "http".to_string(),
                port: 80,
                target_port: 8080,
                node_port: None,
            }],
            service_type: ServiceType::ClusterIP,
        },
        created_at: Utc::now(),
    }
}

pub fn make_node_port_service(name: &str, namespace: &str, ports: u16) -> Service {
    let mut svc = make_service(name, namespace);
    svc.spec.service_type = ServiceType::NodePort;
    svc.spec.ports = (0..ports)
        .map(|i| ServicePort {
            name: format!("port-{}", i),
            port: 80 + i,
            target_port: 8080 + i,
            node_port: Some(30000 + i),
        })
        .collect();
    svc
}

pub fn make_pvc(name: &str, namespace: &str, storage: &str) -> PersistentVolumeClaim {
    let mut requests = ResourceList::new();
    requests.insert("storage".to_string(), Quantity::parse(storage).unwrap());
    PersistentVolumeClaim {
        id: format!("{}-id", name),
        name: name.to_string(),
        namespace: namespace.to_string(),
        storage_class: None,
        access_modes: vec![],
        requests,
        phase: PVCPhase::Pending,
        created_at: Utc::now(),
    }
}
